use std::fmt;

use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use serde::Serialize;

use super::topology::ZoneTopology;

/// Timestamp of the placeholder tick every history starts with.
pub const SENTINEL_TIME: DateTime<Utc> = DateTime::<Utc>::MIN_UTC;

/// The zone a device was placed in for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Assignment {
    /// Strongest connector belongs to a configured zone.
    Known(usize),
    /// Strongest connector isn't part of the topology.
    Unknown,
    /// Nothing was heard during the tick.
    NoData,
}

impl Assignment {
    pub fn has_data(&self) -> bool {
        !matches!(self, Assignment::NoData)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    RowLength {
        connector: String,
        len: usize,
        ticks: usize,
    },
    ColumnLength {
        column: &'static str,
        len: usize,
        ticks: usize,
    },
    TimestampOrder {
        tick: usize,
    },
    DuplicateBufferEntry {
        connector: String,
    },
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvariantViolation::RowLength {
                connector,
                len,
                ticks,
            } => write!(
                f,
                "row for connector {} has {} entries, expected {}",
                connector, len, ticks
            ),
            InvariantViolation::ColumnLength { column, len, ticks } => {
                write!(f, "{} has {} entries, expected {}", column, len, ticks)
            }
            InvariantViolation::TimestampOrder { tick } => {
                write!(f, "timestamp of tick {} is not after its predecessor", tick)
            }
            InvariantViolation::DuplicateBufferEntry { connector } => {
                write!(f, "connector {} is buffered more than once", connector)
            }
        }
    }
}

impl std::error::Error for InvariantViolation {}

/// RSSI samples of one connector, one per tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorRow {
    id: String,
    zone: usize,
    first_tick: usize,
    rssi: Vec<i32>,
}

impl ConnectorRow {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn zone(&self) -> usize {
        self.zone
    }

    /// Tick at which the connector became known. Everything before it is
    /// back-filled with zero.
    pub fn first_tick(&self) -> usize {
        self.first_tick
    }

    pub fn rssi(&self) -> &[i32] {
        &self.rssi
    }
}

/// Append-only signal matrix of a single device.
///
/// Rows are ordered by registration: configured connectors first, in
/// topology order, followed by connectors discovered at runtime. Every row,
/// the timestamps, the assignments and the leaders always have exactly
/// `tick_count()` entries.
#[derive(Debug, Clone)]
pub struct SignalHistory {
    rows: Vec<ConnectorRow>,
    index: HashMap<String, usize>,
    timestamps: Vec<DateTime<Utc>>,
    assignments: Vec<Assignment>,
    /// row that carried the assignment, per tick
    leaders: Vec<Option<usize>>,
}

impl SignalHistory {
    /// Creates a history holding only the placeholder tick, with a row for
    /// every configured connector.
    pub fn new(topology: &ZoneTopology) -> Self {
        let mut history = Self {
            rows: Vec::new(),
            index: HashMap::new(),
            timestamps: Vec::new(),
            assignments: Vec::new(),
            leaders: Vec::new(),
        };
        // configured rows exist before the placeholder, so their first tick is 0
        for (id, zone) in topology.connectors() {
            history.register(id, zone);
        }
        let samples = vec![0; history.rows.len()];
        history.push_tick(SENTINEL_TIME, &samples, None, Assignment::NoData);
        history
    }

    pub fn tick_count(&self) -> usize {
        self.timestamps.len()
    }

    /// Makes room for `ticks` more ticks in every column.
    pub fn reserve(&mut self, ticks: usize) {
        self.timestamps.reserve(ticks);
        self.assignments.reserve(ticks);
        self.leaders.reserve(ticks);
        for row in &mut self.rows {
            row.rssi.reserve(ticks);
        }
    }

    pub fn last_timestamp(&self) -> DateTime<Utc> {
        *self.timestamps.last().unwrap_or(&SENTINEL_TIME)
    }

    pub fn latest(&self) -> Assignment {
        *self.assignments.last().unwrap_or(&Assignment::NoData)
    }

    pub fn row_index(&self, connector: &str) -> Option<usize> {
        self.index.get(connector).copied()
    }

    pub fn row(&self, connector: &str) -> Option<&ConnectorRow> {
        self.row_index(connector).map(|i| &self.rows[i])
    }

    pub fn rows(&self) -> &[ConnectorRow] {
        &self.rows
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    pub fn assignments(&self) -> &[Assignment] {
        &self.assignments
    }

    pub fn leaders(&self) -> &[Option<usize>] {
        &self.leaders
    }

    /// Adds a row for a connector, zero-filled for every tick committed so
    /// far. Returns the existing row if the connector is already known.
    pub(crate) fn register(&mut self, connector: &str, zone: usize) -> usize {
        if let Some(i) = self.row_index(connector) {
            return i;
        }
        let ticks = self.tick_count();
        let mut rssi = Vec::with_capacity(self.timestamps.capacity());
        rssi.resize(ticks, 0);
        let i = self.rows.len();
        self.rows.push(ConnectorRow {
            id: connector.to_string(),
            zone,
            first_tick: ticks,
            rssi,
        });
        self.index.insert(connector.to_string(), i);
        i
    }

    /// Commits one tick. `samples` is indexed by row.
    pub(crate) fn push_tick(
        &mut self,
        time: DateTime<Utc>,
        samples: &[i32],
        leader: Option<usize>,
        assignment: Assignment,
    ) {
        debug_assert_eq!(samples.len(), self.rows.len());
        for (row, sample) in self.rows.iter_mut().zip(samples) {
            row.rssi.push(*sample);
        }
        self.timestamps.push(time);
        self.assignments.push(assignment);
        self.leaders.push(leader);

        debug_assert_eq!(self.check_latest(), Ok(()));
    }

    /// Checks the invariants touched by the most recent commit.
    fn check_latest(&self) -> Result<(), InvariantViolation> {
        self.check_lengths()?;
        let ticks = self.tick_count();
        if ticks > 1 && self.timestamps[ticks - 1] <= self.timestamps[ticks - 2] {
            Err(InvariantViolation::TimestampOrder { tick: ticks - 1 })?
        }
        Ok(())
    }

    fn check_lengths(&self) -> Result<(), InvariantViolation> {
        let ticks = self.tick_count();
        for row in &self.rows {
            if row.rssi.len() != ticks {
                Err(InvariantViolation::RowLength {
                    connector: row.id.clone(),
                    len: row.rssi.len(),
                    ticks,
                })?
            }
        }
        for (column, len) in [
            ("assignments", self.assignments.len()),
            ("leaders", self.leaders.len()),
        ] {
            if len != ticks {
                Err(InvariantViolation::ColumnLength { column, len, ticks })?
            }
        }
        Ok(())
    }

    /// Full consistency check over the whole history.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        self.check_lengths()?;
        for tick in 1..self.timestamps.len() {
            if self.timestamps[tick] <= self.timestamps[tick - 1] {
                Err(InvariantViolation::TimestampOrder { tick })?
            }
        }
        Ok(())
    }
}
