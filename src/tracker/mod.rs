pub mod config;
pub mod error;
pub mod history;
pub mod observation;
pub mod scheduler;
pub mod sensor;
pub mod short;
pub mod source;
pub mod timeline;
pub mod topology;

// Every tracked asset gets its own SensorTracker, and every tracker is owned
// by exactly one scheduler task. Locks between the delivery side and the
// ticking side are avoided entirely: the delivery task validates incoming
// payloads and pushes them down a channel, and the scheduler task is the only
// thing that ever touches a tracker's buffer or history. Ingest, flush and
// flush_empty are therefore serialized for free.

// The same scheduler drives both replay and live operation. In replay the
// cursor is simulated from the first to the last observation in fixed steps,
// and observations are handed over before each step is evaluated. In live
// mode the cursor follows the clock and observations race the ticks: an
// observation that arrives while a tick is being evaluated lands in either
// that tick or the next one. That race is accepted as-is.

// Histories only ever grow. A tick commits a value for every known connector
// at once, so a reader always sees rows of equal length.

pub use config::{ReplayWindow, TrackingConfig};
pub use error::Error;
pub use history::{Assignment, SignalHistory};
pub use observation::{Observation, RawRecord, RoutedObservation, ValidationError};
pub use scheduler::{CommittedTick, TickAction, TrackingScheduler};
pub use sensor::{SensorTracker, TrackerState};
pub use source::{EventSource, ReplayLog, RetryPolicy, TransportError};
pub use timeline::{DeviceTimeline, ZoneSpan};
pub use topology::{ConfigError, ZoneSpec, ZoneTopology};
