use std::time::Duration;

use chrono::{DateTime, Utc};
use typed_builder::TypedBuilder;

use super::{source::RetryPolicy, topology::ConfigError};

/// Default scheduler step.
pub const STREAM_TICK: Duration = Duration::from_secs(1);
/// Default grace period after the last observation before a tick is committed.
pub const SETTLE_WINDOW: Duration = Duration::from_secs(5);
/// Default silence after which a device is considered to be between zones.
pub const TIMEOUT_WINDOW: Duration = Duration::from_secs(60 * 30);

/// Inclusive bounds of the history to replay before going live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ReplayWindow {
    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        self.start <= time && time <= self.end
    }
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct TrackingConfig {
    /// Length of one scheduler step.
    #[builder(default = STREAM_TICK)]
    pub tick: Duration,
    /// Quiet time after the last buffered observation before committing.
    #[builder(default = SETTLE_WINDOW)]
    pub settle: Duration,
    /// Quiet time after which an empty tick is committed.
    #[builder(default = TIMEOUT_WINDOW)]
    pub timeout: Duration,
    /// History to replay before going live. `None` means live only.
    #[builder(default, setter(strip_option))]
    pub replay: Option<ReplayWindow>,
    #[builder(default)]
    pub retry: RetryPolicy,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Scheduler windows converted to calendar durations for comparing against
/// event timestamps.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Windows {
    pub tick: chrono::Duration,
    pub settle: chrono::Duration,
    pub timeout: chrono::Duration,
}

impl TrackingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.windows().map(|_| ())
    }

    pub(crate) fn windows(&self) -> Result<Windows, ConfigError> {
        if self.tick.is_zero() {
            Err(ConfigError::ZeroTick)?
        }
        if self.settle >= self.timeout {
            Err(ConfigError::SettleNotShorterThanTimeout)?
        }
        if let Some(window) = self.replay {
            if window.start > window.end {
                Err(ConfigError::InvertedReplayWindow)?
            }
        }
        let convert = |d: Duration| {
            chrono::Duration::from_std(d).map_err(|_| ConfigError::DurationOutOfRange)
        };
        Ok(Windows {
            tick: convert(self.tick)?,
            settle: convert(self.settle)?,
            timeout: convert(self.timeout)?,
        })
    }
}
