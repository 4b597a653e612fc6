//! Runtime configuration for the thread-emulated backend.
//!
//! Values come from [`RuntimeConfig::default`], the `with_*` builders, or the
//! environment via [`RuntimeConfig::from_env`].
//!
//! # Environment Variables
//!
//! | Variable | Field | Description |
//! |----------|-------|-------------|
//! | `MPCOMM_SPIN_COUNT` | `spin_count` | Spin iterations before a rendezvous waiter parks |
//! | `MPCOMM_STACK_SIZE` | `stack_size` | Stack size in bytes for rank threads |
//! | `MPCOMM_THREAD_PREFIX` | `thread_name_prefix` | Prefix for rank thread names |

use std::env;

/// Spin iterations before a rendezvous waiter falls back to blocking.
///
/// This is a tuning knob only; no value is right on every machine.
pub const DEFAULT_SPIN_COUNT: u32 = 4096;

/// Settings shared by every rank group spawned from one
/// [`ThreadRuntime`](crate::ThreadRuntime).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Spin budget of a rendezvous waiter before it parks on the monitor.
    /// Zero parks immediately.
    pub spin_count: u32,
    /// Rank threads are named `{prefix}-{group}-{rank}`.
    pub thread_name_prefix: String,
    /// Stack size for rank threads; `None` uses the platform default.
    pub stack_size: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            spin_count: DEFAULT_SPIN_COUNT,
            thread_name_prefix: "mpcomm-rank".to_string(),
            stack_size: None,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by any `MPCOMM_*` variables that are set and parse.
    pub fn from_env() -> Self {
        let mut config = RuntimeConfig::default();
        if let Some(spin) = parse_var("MPCOMM_SPIN_COUNT") {
            config.spin_count = spin;
        }
        if let Some(stack) = parse_var("MPCOMM_STACK_SIZE") {
            config.stack_size = Some(stack);
        }
        if let Ok(prefix) = env::var("MPCOMM_THREAD_PREFIX") {
            if !prefix.is_empty() {
                config.thread_name_prefix = prefix;
            }
        }
        config
    }

    /// Set the rendezvous spin budget.
    pub fn with_spin_count(mut self, spin_count: u32) -> Self {
        self.spin_count = spin_count;
        self
    }

    /// Set the rank thread name prefix.
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Set the rank thread stack size.
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_override_defaults() {
        let config = RuntimeConfig::default()
            .with_spin_count(0)
            .with_stack_size(1 << 20)
            .with_thread_name_prefix("worker");
        assert_eq!(config.spin_count, 0);
        assert_eq!(config.stack_size, Some(1 << 20));
        assert_eq!(config.thread_name_prefix, "worker");
    }

    /// Environment mutation stays in one test so parallel tests never race
    /// on the same variables.
    #[test]
    fn env_var_parsing() {
        env::set_var("MPCOMM_SPIN_COUNT", "128");
        env::set_var("MPCOMM_STACK_SIZE", "not-a-number");
        env::remove_var("MPCOMM_THREAD_PREFIX");
        let config = RuntimeConfig::from_env();
        assert_eq!(config.spin_count, 128);
        assert_eq!(config.stack_size, None);
        assert_eq!(config.thread_name_prefix, "mpcomm-rank");

        env::set_var("MPCOMM_STACK_SIZE", " 65536 ");
        env::set_var("MPCOMM_THREAD_PREFIX", "sim");
        let config = RuntimeConfig::from_env();
        assert_eq!(config.stack_size, Some(65536));
        assert_eq!(config.thread_name_prefix, "sim");

        env::remove_var("MPCOMM_SPIN_COUNT");
        env::remove_var("MPCOMM_STACK_SIZE");
        env::remove_var("MPCOMM_THREAD_PREFIX");
        assert_eq!(RuntimeConfig::from_env(), RuntimeConfig::default());
    }
}
