use tracing_subscriber::EnvFilter;

pub fn init_logging() {
    // Prefer not to fail if a subscriber is already set elsewhere.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    // Panic hook that reports to stderr without requiring tracing macros.
    std::panic::set_hook(Box::new(|pi| {
        eprintln!("panic: {}", pi);
    }));
}
