use std::fmt;

use hashbrown::HashMap;
use serde::Deserialize;

/// A zone as it appears in configuration: an optional label and the
/// connectors installed in it, in the order they should be displayed.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ZoneSpec {
    #[serde(default)]
    pub name: Option<String>,
    pub connectors: Vec<String>,
}

impl ZoneSpec {
    pub fn new<I, S>(name: impl Into<String>, connectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: Some(name.into()),
            connectors: connectors.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    NoZones,
    EmptyZone { zone: usize },
    EmptyConnectorId { zone: usize },
    DuplicateConnector { connector: String },
    DuplicateDevice { device: String },
    ZeroTick,
    SettleNotShorterThanTimeout,
    DurationOutOfRange,
    InvertedReplayWindow,
    Malformed(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NoZones => write!(f, "zone topology has no zones"),
            ConfigError::EmptyZone { zone } => {
                write!(f, "zone {} has no connectors", zone)
            }
            ConfigError::EmptyConnectorId { zone } => {
                write!(f, "zone {} lists an empty connector id", zone)
            }
            ConfigError::DuplicateConnector { connector } => {
                write!(f, "connector {} is listed in more than one place", connector)
            }
            ConfigError::DuplicateDevice { device } => {
                write!(f, "device {} is tracked twice", device)
            }
            ConfigError::ZeroTick => write!(f, "tick interval must be non-zero"),
            ConfigError::SettleNotShorterThanTimeout => {
                write!(f, "settle window must be shorter than the timeout window")
            }
            ConfigError::DurationOutOfRange => {
                write!(f, "duration is too large to represent")
            }
            ConfigError::InvertedReplayWindow => {
                write!(f, "replay window starts after it ends")
            }
            ConfigError::Malformed(e) => write!(f, "malformed topology: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Malformed(e.to_string())
    }
}

/// Static mapping from connector to zone.
///
/// Zones are indexed in configuration order. Any connector that isn't listed
/// belongs to the unknown zone, whose index is one past the last real zone.
#[derive(Debug, Clone)]
pub struct ZoneTopology {
    zones: Vec<ZoneSpec>,
    /// configured connectors in zone order, then listing order
    connectors: Vec<(String, usize)>,
    lookup: HashMap<String, usize>,
}

impl ZoneTopology {
    pub fn new(zones: Vec<ZoneSpec>) -> Result<Self, ConfigError> {
        if zones.is_empty() {
            Err(ConfigError::NoZones)?
        }

        let mut connectors = Vec::new();
        let mut lookup = HashMap::new();
        for (zone, spec) in zones.iter().enumerate() {
            if spec.connectors.is_empty() {
                Err(ConfigError::EmptyZone { zone })?
            }
            for connector in &spec.connectors {
                if connector.is_empty() {
                    Err(ConfigError::EmptyConnectorId { zone })?
                }
                if lookup.insert(connector.clone(), zone).is_some() {
                    Err(ConfigError::DuplicateConnector {
                        connector: connector.clone(),
                    })?
                }
                connectors.push((connector.clone(), zone));
            }
        }

        Ok(Self {
            zones,
            connectors,
            lookup,
        })
    }

    /// Parses a JSON array of zones, e.g.
    /// `[{"name": "lobby", "connectors": ["c1", "c2"]}]`.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let zones: Vec<ZoneSpec> = serde_json::from_str(json)?;
        Self::new(zones)
    }

    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    /// The index every unconfigured connector maps to.
    pub fn unknown_zone(&self) -> usize {
        self.zones.len()
    }

    pub fn zone_of(&self, connector: &str) -> usize {
        self.lookup
            .get(connector)
            .copied()
            .unwrap_or_else(|| self.unknown_zone())
    }

    pub fn is_known(&self, zone: usize) -> bool {
        zone < self.zones.len()
    }

    /// Configured connectors with their zone, in configuration order.
    pub fn connectors(&self) -> impl Iterator<Item = (&str, usize)> + '_ {
        self.connectors.iter().map(|(id, zone)| (id.as_str(), *zone))
    }

    pub fn zone_name(&self, zone: usize) -> Option<&str> {
        self.zones.get(zone).and_then(|z| z.name.as_deref())
    }
}
