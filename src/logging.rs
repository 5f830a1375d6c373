use tracing::Level;

/// Install a fmt subscriber at `level`. Safe to call more than once; later
/// calls are ignored once a global subscriber exists.
pub fn init_tracing(level: &str) {
    let level = level.parse::<Level>().unwrap_or(Level::INFO);
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .try_init();
}
