//! Core configuration

use std::time::Duration;

/// Protocol timers and caps
///
/// Defaults are the wire-protocol values; tests shrink the timers.
#[derive(Clone, Debug)]
pub struct Config {
    /// Time without an accepted response handshake before an exchange breaks
    pub break_timeout: Duration,

    /// Idle time (no live channels) before an exchange expires
    pub expire_timeout: Duration,

    /// Grace period after a local `end` before channel state is torn down
    pub close_grace: Duration,

    /// Handshake rekey backoff floor in seconds
    pub handshake_backoff_floor: u64,

    /// Handshake rekey backoff cap in seconds
    pub handshake_backoff_cap: u64,

    /// Outstanding packets allowed on a reliable channel
    pub send_window: usize,

    /// Maximum entries in a `miss` list
    pub miss_cap: usize,

    /// Initial reliable-channel retransmit timeout
    pub resend_seed: Duration,

    /// Pending channels allowed per listener
    pub listener_backlog: usize,

    /// Buffered events on the endpoint bus
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            break_timeout: Duration::from_secs(2 * 60),
            expire_timeout: Duration::from_secs(2 * 60),
            close_grace: Duration::from_secs(60),
            handshake_backoff_floor: 1,
            handshake_backoff_cap: 60,
            send_window: 100,
            miss_cap: 100,
            resend_seed: Duration::from_secs(1),
            listener_backlog: 8,
            event_capacity: 64,
        }
    }
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.break_timeout.is_zero() {
            return Err("break timeout must be nonzero".into());
        }
        if self.expire_timeout.is_zero() {
            return Err("expire timeout must be nonzero".into());
        }
        if self.send_window == 0 {
            return Err("send window must be at least 1".into());
        }
        if self.handshake_backoff_floor == 0 {
            return Err("handshake backoff floor must be at least 1".into());
        }
        if self.handshake_backoff_cap < self.handshake_backoff_floor {
            return Err("handshake backoff cap below floor".into());
        }
        if self.listener_backlog == 0 {
            return Err("listener backlog must be at least 1".into());
        }
        Ok(())
    }

    /// Shrunk timers for loopback tests
    ///
    /// The break timeout stays above the 1 s rekey floor so healthy
    /// exchanges keep resetting it.
    #[cfg(test)]
    pub(crate) fn fast() -> Self {
        Self {
            break_timeout: Duration::from_millis(2500),
            expire_timeout: Duration::from_millis(400),
            close_grace: Duration::from_millis(300),
            handshake_backoff_floor: 1,
            handshake_backoff_cap: 1,
            resend_seed: Duration::from_millis(60),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let mut config = Config::default();
        config.send_window = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.handshake_backoff_cap = 0;
        assert!(config.validate().is_err());
    }
}
