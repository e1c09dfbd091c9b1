// src/config.rs
//! Backplane tuning knobs.

use std::time::Duration;

pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_MAX_FRAME: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackplaneConfig {
    /// Period of the per-registry subscription cleanup timer. Read once per activation.
    pub cleanup_interval: Duration,
    /// Registries with no calls for this long are deactivated. `None` keeps them resident.
    pub idle_timeout: Option<Duration>,
    /// Bounded connection mailboxes (drop-new) when set.
    pub mailbox_capacity: Option<usize>,
    /// Largest frame accepted by the node transport, in bytes.
    pub max_frame_len: usize,
}

impl Default for BackplaneConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            mailbox_capacity: None,
            max_frame_len: DEFAULT_MAX_FRAME,
        }
    }
}

impl BackplaneConfig {
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_mailbox_capacity(mut self, capacity: Option<usize>) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    pub fn with_max_frame_len(mut self, bytes: usize) -> Self {
        self.max_frame_len = bytes;
        self
    }

    /// Defaults overridden by environment variables:
    ///
    /// - `BACKPLANE_CLEANUP_INTERVAL_MS`
    /// - `BACKPLANE_IDLE_TIMEOUT_SECS` (`0` disables idle deactivation)
    /// - `BACKPLANE_MAILBOX_CAPACITY`
    /// - `BACKPLANE_MAX_FRAME_LEN`
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(ms) = parse_var::<u64, _>(&lookup, "BACKPLANE_CLEANUP_INTERVAL_MS") {
            if ms > 0 {
                cfg.cleanup_interval = Duration::from_millis(ms);
            }
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "BACKPLANE_IDLE_TIMEOUT_SECS") {
            cfg.idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(cap) = parse_var::<usize, _>(&lookup, "BACKPLANE_MAILBOX_CAPACITY") {
            cfg.mailbox_capacity = (cap > 0).then_some(cap);
        }
        if let Some(len) = parse_var::<usize, _>(&lookup, "BACKPLANE_MAX_FRAME_LEN") {
            cfg.max_frame_len = len;
        }
        cfg
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "ignoring unparseable setting");
            None
        }
    }
}
