// Thin logging facade. Messages go through `tracing`; the binary decides
// where they end up (see `init`).

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::ChronoLocal;

/// Install the global subscriber. `default_filter` applies when RUST_LOG is unset.
/// Safe to call more than once (later calls are ignored).
pub fn init(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::rfc_3339())
        .try_init();
}

// Normal progress.
pub fn info(msg: &str) {
    tracing::info!("{msg}");
}

// Suspicious, but the simulation keeps going.
pub fn warn(msg: &str) {
    tracing::warn!("{msg}");
}

// Something broke (fault, NaN); the caller has already recovered.
pub fn error(msg: &str) {
    tracing::error!("{msg}");
}

pub fn debug(msg: &str) {
    tracing::debug!("{msg}");
}

// Numeric metrics in one greppable shape: SCALAR step=.. name=.. value=..
pub fn scalar(step: u64, name: &str, value: f32) {
    tracing::info!(target: "scalar", "SCALAR step={} name={} value={:.6}", step, name, value);
}
