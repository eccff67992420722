//! Session configuration. Everything the driver used to pick up from the
//! process environment or hard-code in its retry loops is passed in here.

use crate::codec::PacketFormat;

use getset::{CopyGetters, Getters};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared stop flag, checked between iterations of every retry loop
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bounds for the reconnect and recovery loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// connect attempts after a reset
    pub attempts: u32,
    /// pause between connect attempts
    pub interval: Duration,
    /// pause after closing before the first attempt
    pub settle: Duration,
    /// enumeration polling while waiting for a device to appear
    pub poll_interval: Duration,
    /// pause after a failed CAN receive
    pub recv_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 15,
            interval: Duration::from_secs(1),
            settle: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
            recv_backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// No sleeping at all, for driving the loops against a fake bus
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            interval: Duration::ZERO,
            settle: Duration::ZERO,
            poll_interval: Duration::ZERO,
            recv_backoff: Duration::ZERO,
        }
    }
}

/// Per-transfer timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub control: Duration,
    /// resets are answered late, if at all
    pub reset: Duration,
    /// the device NAKs CAN writes while the bus is congested
    pub can_send: Duration,
    pub can_recv: Duration,
    pub flash: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            control: Duration::from_secs(1),
            reset: Duration::from_secs(15),
            can_send: Duration::from_millis(10),
            can_recv: Duration::from_millis(100),
            flash: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogConfig {
    pub level: log::LevelFilter,
    /// log every frame that crosses the wire at trace level
    pub trace_frames: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: log::LevelFilter::Info,
            trace_frames: false,
        }
    }
}

/// Install an `env_logger` with the configured level. Safe to call more than
/// once; only the first call takes effect.
pub fn init_logging(config: &LogConfig) {
    let _ = env_logger::Builder::new()
        .filter_level(config.level)
        .format_timestamp_millis()
        .try_init();
}

#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct SessionConfig {
    /// only connect to the device with this USB serial
    #[getset(get = "pub")]
    serial: Option<String>,
    #[getset(get_copy = "pub")]
    claim: bool,
    /// where the application and bootstub images live
    #[getset(get = "pub")]
    firmware_dir: PathBuf,
    /// force a wire format instead of going by the advertised version
    #[getset(get_copy = "pub")]
    packet_format: Option<PacketFormat>,
    #[getset(get_copy = "pub")]
    timeouts: Timeouts,
    #[getset(get_copy = "pub")]
    retry: RetryPolicy,
    #[getset(get_copy = "pub")]
    log: LogConfig,
    #[getset(get = "pub")]
    cancel: CancelToken,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            serial: None,
            claim: true,
            firmware_dir: PathBuf::from("firmware"),
            packet_format: None,
            timeouts: Timeouts::default(),
            retry: RetryPolicy::default(),
            log: LogConfig::default(),
            cancel: CancelToken::new(),
        }
    }
}

impl SessionConfig {
    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    pub fn with_claim(mut self, claim: bool) -> Self {
        self.claim = claim;
        self
    }

    pub fn with_firmware_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.firmware_dir = dir.as_ref().to_owned();
        self
    }

    pub fn with_packet_format(mut self, format: PacketFormat) -> Self {
        self.packet_format = Some(format);
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_log(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub(crate) fn set_serial(&mut self, serial: Option<String>) {
        self.serial = serial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_device_behaviour() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.attempts, 15);
        assert_eq!(retry.interval, Duration::from_secs(1));
        assert_eq!(retry.poll_interval, Duration::from_millis(100));
        assert_eq!(Timeouts::default().can_send, Duration::from_millis(10));
    }

    #[test]
    fn logging_can_be_initialised_twice() {
        let config = LogConfig {
            level: log::LevelFilter::Debug,
            trace_frames: true,
        };
        init_logging(&config);
        init_logging(&config);
        log::debug!("logger installed");
    }

    #[test]
    fn cancel_is_shared_between_clones() {
        let token = CancelToken::new();
        let config = SessionConfig::default().with_cancel(token.clone());
        assert!(!config.cancel().is_cancelled());
        token.cancel();
        assert!(config.cancel().is_cancelled());
    }
}
