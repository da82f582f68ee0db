use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{
    history::{Assignment, SignalHistory},
    sensor::SensorTracker,
    topology::ZoneTopology,
};

/// A stretch of consecutive ticks spent in the same zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ZoneSpan {
    pub assignment: Assignment,
    pub start: DateTime<Utc>,
    /// Timestamp of the tick that ended the span, or of the span's own last
    /// tick if nothing followed it.
    pub end: DateTime<Utc>,
    pub ticks: usize,
}

impl SignalHistory {
    /// Collapses the committed ticks into zone spans. Empty ticks separate
    /// spans and never start one. The placeholder tick is skipped.
    pub fn spans(&self) -> Vec<ZoneSpan> {
        let timestamps = self.timestamps();
        let mut spans = Vec::new();
        let mut open: Option<ZoneSpan> = None;

        for (i, &assignment) in self.assignments().iter().enumerate().skip(1) {
            let time = timestamps[i];
            if let Some(span) = open.as_mut() {
                if span.assignment == assignment {
                    span.ticks += 1;
                    span.end = time;
                    continue;
                }
                span.end = time;
            }
            spans.extend(open.take());
            if assignment.has_data() {
                open = Some(ZoneSpan {
                    assignment,
                    start: time,
                    end: time,
                    ticks: 1,
                });
            }
        }
        spans.extend(open);
        spans
    }
}

/// Human readable name for an assignment.
pub fn zone_label(topology: &ZoneTopology, assignment: Assignment) -> String {
    match assignment {
        Assignment::Known(zone) => match topology.zone_name(zone) {
            Some(name) => name.to_string(),
            None => format!("Loc {}", zone),
        },
        Assignment::Unknown => "Uncategorized".to_string(),
        Assignment::NoData => "no data".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelineRow {
    pub connector: String,
    pub zone: usize,
    pub rssi: Vec<i32>,
}

/// Everything a report needs about one device, index-aligned by tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceTimeline {
    pub device_id: String,
    pub zone_names: Vec<String>,
    pub unknown_zone: usize,
    pub timestamps: Vec<DateTime<Utc>>,
    pub rows: Vec<TimelineRow>,
    pub assignments: Vec<Assignment>,
    /// connector that decided each tick
    pub leaders: Vec<Option<String>>,
    pub spans: Vec<ZoneSpan>,
}

impl DeviceTimeline {
    pub fn from_tracker(tracker: &SensorTracker) -> Self {
        let topology = tracker.topology();
        let history = tracker.history();
        let rows = history.rows();

        Self {
            device_id: tracker.device_id().to_string(),
            zone_names: (0..topology.zone_count())
                .map(|zone| zone_label(topology, Assignment::Known(zone)))
                .collect(),
            unknown_zone: topology.unknown_zone(),
            timestamps: history.timestamps()[1..].to_vec(),
            rows: rows
                .iter()
                .map(|row| TimelineRow {
                    connector: row.id().to_string(),
                    zone: row.zone(),
                    rssi: row.rssi()[1..].to_vec(),
                })
                .collect(),
            assignments: history.assignments()[1..].to_vec(),
            leaders: history.leaders()[1..]
                .iter()
                .map(|leader| leader.map(|i| rows[i].id().to_string()))
                .collect(),
            spans: history.spans(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;

    use super::*;
    use crate::tracker::{observation::Observation, topology::ZoneSpec};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_600_000_000 + secs, 0).unwrap()
    }

    fn tracker() -> SensorTracker {
        let topology = ZoneTopology::new(vec![
            ZoneSpec::new("desk", ["a"]),
            ZoneSpec {
                name: None,
                connectors: vec!["b".into()],
            },
        ])
        .unwrap();
        SensorTracker::new("dev", Arc::new(topology))
    }

    fn hear(t: &mut SensorTracker, connector: &str, secs: i64) {
        t.ingest(Observation {
            connector_id: connector.into(),
            signal_strength: 50,
            event_time: at(secs),
        });
        t.flush(at(secs + 1)).unwrap();
    }

    #[test]
    fn spans_follow_zone_changes() {
        let mut t = tracker();
        hear(&mut t, "a", 0); // tick at 1
        hear(&mut t, "a", 10); // 11
        hear(&mut t, "b", 20); // 21
        t.flush_empty(at(30)).unwrap();
        hear(&mut t, "x", 40); // 41
        hear(&mut t, "x", 50); // 51

        let spans = t.history().spans();
        assert_eq!(
            spans,
            vec![
                ZoneSpan {
                    assignment: Assignment::Known(0),
                    start: at(1),
                    end: at(21),
                    ticks: 2,
                },
                ZoneSpan {
                    assignment: Assignment::Known(1),
                    start: at(21),
                    end: at(30),
                    ticks: 1,
                },
                ZoneSpan {
                    assignment: Assignment::Unknown,
                    start: at(41),
                    end: at(51),
                    ticks: 2,
                },
            ]
        );
    }

    #[test]
    fn no_spans_without_data() {
        let mut t = tracker();
        t.flush_empty(at(1)).unwrap();
        assert!(t.history().spans().is_empty());
    }

    #[test]
    fn timeline_drops_the_placeholder_tick() {
        let mut t = tracker();
        hear(&mut t, "b", 0);
        hear(&mut t, "x", 10);

        let timeline = DeviceTimeline::from_tracker(&t);
        assert_eq!(timeline.device_id, "dev");
        assert_eq!(timeline.zone_names, vec!["desk", "Loc 1"]);
        assert_eq!(timeline.unknown_zone, 2);
        assert_eq!(timeline.timestamps, vec![at(1), at(11)]);
        assert_eq!(
            timeline.assignments,
            vec![Assignment::Known(1), Assignment::Unknown]
        );
        assert_eq!(
            timeline.leaders,
            vec![Some("b".to_string()), Some("x".to_string())]
        );
        let x = timeline.rows.iter().find(|r| r.connector == "x").unwrap();
        assert_eq!(x.rssi, vec![0, 50]);
        assert_eq!(x.zone, 2);
        for row in &timeline.rows {
            assert_eq!(row.rssi.len(), timeline.timestamps.len());
        }
    }

    #[test]
    fn serializes_assignments() {
        let json = serde_json::to_string(&[
            Assignment::Known(3),
            Assignment::Unknown,
            Assignment::NoData,
        ])
        .unwrap();
        assert_eq!(json, r#"[{"known":3},"unknown","no_data"]"#);
    }
}
