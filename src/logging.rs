use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Initialize logging for the network core
pub fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            EnvFilter::new("filezap=debug,libp2p=info")
        } else {
            EnvFilter::new("filezap=info,libp2p=warn")
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)?;

    Ok(())
}

/// Initialize logging, falling back to stderr-only output if setup fails
pub fn init_logging_safe() {
    if let Err(e) = init_logging() {
        eprintln!("Warning: failed to set up tracing: {}. Continuing without it.", e);
    }
}
