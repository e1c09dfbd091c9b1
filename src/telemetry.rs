// src/telemetry.rs
//! Log output for binaries embedding the backplane.

/// Install a global fmt subscriber at `level`. A subscriber installed
/// earlier wins; this call is then a no-op.
pub fn init(level: tracing::Level) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
}
