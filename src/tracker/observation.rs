use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One connector hearing one device at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub connector_id: String,
    pub signal_strength: i32,
    pub event_time: DateTime<Utc>,
}

/// An observation together with the device it was reported for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutedObservation {
    pub device_id: String,
    pub observation: Observation,
}

impl RoutedObservation {
    pub fn new(
        device_id: impl Into<String>,
        connector_id: impl Into<String>,
        signal_strength: i32,
        event_time: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            observation: Observation {
                connector_id: connector_id.into(),
                signal_strength,
                event_time,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    MissingDevice,
    MissingConnector,
    MissingSignalStrength,
    SignalStrengthOutOfRange(i64),
    MissingEventTime,
    BadEventTime(String),
    Malformed(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::MissingDevice => write!(f, "no target device"),
            ValidationError::MissingConnector => write!(f, "no connector id"),
            ValidationError::MissingSignalStrength => write!(f, "no signal strength"),
            ValidationError::SignalStrengthOutOfRange(v) => {
                write!(f, "signal strength {} out of range", v)
            }
            ValidationError::MissingEventTime => write!(f, "no event time"),
            ValidationError::BadEventTime(t) => write!(f, "unparseable event time {:?}", t),
            ValidationError::Malformed(e) => write!(f, "malformed payload: {}", e),
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<serde_json::Error> for ValidationError {
    fn from(e: serde_json::Error) -> Self {
        ValidationError::Malformed(e.to_string())
    }
}

/// An undecoded payload exactly as a source delivered it. Nothing in here
/// has been checked yet; convert it into a [`RoutedObservation`] first.
///
/// Two shapes are understood: the flat record
///
/// ```json
/// {"target_device_id": "d1", "connector_id": "c1", "signal_strength": 80,
///  "event_time": "2020-06-01T12:00:00Z"}
/// ```
///
/// and the network status event emitted by cloud connectors
///
/// ```json
/// {"targetName": "projects/p/devices/d1", "data": {"networkStatus": {
///   "cloudConnectors": [{"id": "c1", "signalStrength": 80}],
///   "updateTime": "2020-06-01T12:00:00Z"}}}
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawRecord {
    NetworkStatus(NetworkStatusEvent),
    Flat(FlatRecord),
}

/// Extra fields are ignored, so a flat record carrying more than it needs
/// still reports exactly what it lacks.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FlatRecord {
    pub target_device_id: Option<String>,
    pub connector_id: Option<String>,
    pub signal_strength: Option<i64>,
    pub event_time: Option<String>,
}

// `targetName` is what tells an event apart from a flat record, so it is the
// one field that is required here
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatusEvent {
    pub target_name: String,
    pub data: Option<EventData>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    pub network_status: Option<NetworkStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    #[serde(default)]
    pub cloud_connectors: Vec<CloudConnector>,
    pub update_time: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudConnector {
    pub id: Option<String>,
    pub signal_strength: Option<i64>,
}

impl RawRecord {
    pub fn from_json(json: &str) -> Result<Self, ValidationError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Event time as carried by the payload, if it parses. Used to order a
    /// history before its records are validated.
    pub fn event_time(&self) -> Option<DateTime<Utc>> {
        let raw = match self {
            RawRecord::Flat(r) => r.event_time.as_deref(),
            RawRecord::NetworkStatus(e) => e
                .data
                .as_ref()
                .and_then(|d| d.network_status.as_ref())
                .and_then(|s| s.update_time.as_deref()),
        };
        raw.and_then(|t| parse_time(t).ok())
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, ValidationError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| ValidationError::BadEventTime(raw.to_string()))
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.is_empty())
}

impl TryFrom<RawRecord> for RoutedObservation {
    type Error = ValidationError;

    fn try_from(record: RawRecord) -> Result<Self, Self::Error> {
        let (device, connector, strength, time) = match record {
            RawRecord::Flat(r) => (
                r.target_device_id,
                r.connector_id,
                r.signal_strength,
                r.event_time,
            ),
            RawRecord::NetworkStatus(e) => {
                // resource names look like projects/<p>/devices/<id>
                let device = e.target_name.rsplit('/').next().map(str::to_string);
                let status = e.data.and_then(|d| d.network_status).unwrap_or_default();
                let strongest = status.cloud_connectors.into_iter().next().unwrap_or_default();
                (device, strongest.id, strongest.signal_strength, status.update_time)
            }
        };

        let device_id = non_empty(device).ok_or(ValidationError::MissingDevice)?;
        let connector_id = non_empty(connector).ok_or(ValidationError::MissingConnector)?;
        let strength = strength.ok_or(ValidationError::MissingSignalStrength)?;
        let signal_strength = i32::try_from(strength)
            .map_err(|_| ValidationError::SignalStrengthOutOfRange(strength))?;
        let event_time = parse_time(&time.ok_or(ValidationError::MissingEventTime)?)?;

        Ok(RoutedObservation {
            device_id,
            observation: Observation {
                connector_id,
                signal_strength,
                event_time,
            },
        })
    }
}
