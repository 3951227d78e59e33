use tracing::Level;

/// Maps a configured level name onto a tracing `Level`; unknown names mean
/// `info`.
pub fn parse_level(name: &str) -> Level {
    match name.trim().to_ascii_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" | "warning" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Installs the global fmt subscriber at `level`.
///
/// Returns `false` when another subscriber was already installed (a second
/// call, or a binary embedding the broker); that one is left in place.
pub fn init(level: &str) -> bool {
    let max_level = parse_level(level);
    match tracing_subscriber::fmt()
        .with_max_level(max_level)
        .with_target(false)
        .try_init()
    {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(error = %e, requested = %max_level, "tracing subscriber already installed");
            false
        }
    }
}
