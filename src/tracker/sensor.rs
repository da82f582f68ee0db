use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use tracing::{trace, warn};

use super::{
    history::{Assignment, InvariantViolation, SignalHistory},
    observation::Observation,
    short::ShortIdExt,
    topology::ZoneTopology,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Idle,
    Buffering,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    /// A tick was requested at or before the previous tick's timestamp.
    NonMonotonicTick {
        last: DateTime<Utc>,
        attempted: DateTime<Utc>,
    },
    /// `flush_empty` was called while observations were still buffered.
    BufferNotEmpty,
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerError::NonMonotonicTick { last, attempted } => write!(
                f,
                "tick at {} does not follow previous tick at {}",
                attempted, last
            ),
            TrackerError::BufferNotEmpty => {
                write!(f, "cannot commit an empty tick over buffered observations")
            }
        }
    }
}

impl std::error::Error for TrackerError {}

/// Latest observation per connector within the current buffering window.
///
/// Kept as a vector in first-arrival order: connectors discovered in the same
/// tick are registered in the order they were first heard.
#[derive(Debug, Default, Clone)]
struct EventBuffer {
    entries: Vec<Observation>,
}

impl EventBuffer {
    /// Returns true if the connector was already buffered.
    fn upsert(&mut self, observation: Observation) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|e| e.connector_id == observation.connector_id)
        {
            Some(existing) => {
                *existing = observation;
                true
            }
            None => {
                self.entries.push(observation);
                false
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn get(&self, connector: &str) -> Option<&Observation> {
        self.entries.iter().find(|e| e.connector_id == connector)
    }

    fn take(&mut self) -> Vec<Observation> {
        std::mem::take(&mut self.entries)
    }

    fn check(&self) -> Result<(), InvariantViolation> {
        for (i, e) in self.entries.iter().enumerate() {
            if self.entries[..i]
                .iter()
                .any(|o| o.connector_id == e.connector_id)
            {
                Err(InvariantViolation::DuplicateBufferEntry {
                    connector: e.connector_id.clone(),
                })?
            }
        }
        Ok(())
    }
}

/// Buffers the observations of a single device and commits them to its
/// signal history one tick at a time.
pub struct SensorTracker {
    device_id: String,
    topology: Arc<ZoneTopology>,
    state: TrackerState,
    last_event_time: Option<DateTime<Utc>>,
    buffer: EventBuffer,
    history: SignalHistory,
}

impl SensorTracker {
    pub fn new(device_id: impl Into<String>, topology: Arc<ZoneTopology>) -> Self {
        let history = SignalHistory::new(&topology);
        Self {
            device_id: device_id.into(),
            topology,
            state: TrackerState::Idle,
            last_event_time: None,
            buffer: EventBuffer::default(),
            history,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    /// Event time of the most recently ingested observation, or `None` if
    /// the device has never been heard.
    pub fn last_event_time(&self) -> Option<DateTime<Utc>> {
        self.last_event_time
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn buffered_signal(&self, connector: &str) -> Option<i32> {
        self.buffer.get(connector).map(|o| o.signal_strength)
    }

    pub fn history(&self) -> &SignalHistory {
        &self.history
    }

    pub fn topology(&self) -> &ZoneTopology {
        &self.topology
    }

    /// Grows the history's columns ahead of a known number of ticks.
    pub fn reserve(&mut self, ticks: usize) {
        self.history.reserve(ticks);
    }

    /// Buffers an observation. A connector that is already buffered has its
    /// observation replaced.
    pub fn ingest(&mut self, observation: Observation) {
        debug_assert!(!observation.connector_id.is_empty());
        trace!(
            "device {} heard by {} at {}",
            self.device_id.short(),
            observation.connector_id.short(),
            observation.signal_strength
        );
        self.last_event_time = Some(observation.event_time);
        self.buffer.upsert(observation);
        self.state = TrackerState::Buffering;

        debug_assert_eq!(self.buffer.check(), Ok(()));
    }

    /// Commits the buffered observations as one tick and returns the zone
    /// assignment made for it.
    pub fn flush(&mut self, tick_time: DateTime<Utc>) -> Result<Assignment, TrackerError> {
        self.check_tick_time(tick_time)?;

        if self.buffer.is_empty() {
            warn!(
                "flush for device {} with nothing buffered, committing an empty tick",
                self.device_id.short()
            );
            self.commit_empty(tick_time);
            self.state = TrackerState::Idle;
            return Ok(Assignment::NoData);
        }

        let buffered = self.buffer.take();
        let mut reported = Vec::with_capacity(buffered.len());
        for observation in &buffered {
            let row = match self.history.row_index(&observation.connector_id) {
                Some(row) => row,
                None => {
                    let zone = self.topology.zone_of(&observation.connector_id);
                    trace!(
                        "device {} discovered connector {} at tick {}",
                        self.device_id.short(),
                        observation.connector_id.short(),
                        self.history.tick_count()
                    );
                    self.history.register(&observation.connector_id, zone)
                }
            };
            reported.push((row, observation.signal_strength));
        }

        let mut samples = vec![0; self.history.rows().len()];
        for &(row, rssi) in &reported {
            samples[row] = rssi;
        }

        // rows are scanned in registration order and only a strictly greater
        // value takes the lead, so ties go to the earliest registered row
        let mut leader: Option<(usize, i32)> = None;
        for (row, &rssi) in samples.iter().enumerate() {
            if !reported.iter().any(|&(r, _)| r == row) {
                continue;
            }
            if leader.map_or(true, |(_, max)| rssi > max) {
                leader = Some((row, rssi));
            }
        }
        let leader = leader.map(|(row, _)| row);

        let assignment = match leader {
            Some(row) => {
                let zone = self.history.rows()[row].zone();
                if self.topology.is_known(zone) {
                    Assignment::Known(zone)
                } else {
                    Assignment::Unknown
                }
            }
            None => Assignment::NoData,
        };

        self.history.push_tick(tick_time, &samples, leader, assignment);
        self.state = TrackerState::Idle;
        Ok(assignment)
    }

    /// Commits a tick in which nothing was heard.
    pub fn flush_empty(&mut self, tick_time: DateTime<Utc>) -> Result<(), TrackerError> {
        if !self.buffer.is_empty() {
            Err(TrackerError::BufferNotEmpty)?
        }
        self.check_tick_time(tick_time)?;
        self.commit_empty(tick_time);
        Ok(())
    }

    fn commit_empty(&mut self, tick_time: DateTime<Utc>) {
        let samples = vec![0; self.history.rows().len()];
        self.history.push_tick(tick_time, &samples, None, Assignment::NoData);
    }

    fn check_tick_time(&self, tick_time: DateTime<Utc>) -> Result<(), TrackerError> {
        let last = self.history.last_timestamp();
        if tick_time <= last {
            Err(TrackerError::NonMonotonicTick {
                last,
                attempted: tick_time,
            })?
        }
        Ok(())
    }
}
