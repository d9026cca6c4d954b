use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Identifies one dump within a bundle. Rendered as "bundle:dump".
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct DumpIdentifier {
    pub bundle_id: String,
    pub dump_id: String,
}

impl DumpIdentifier {
    pub fn new(bundle_id: impl Into<String>, dump_id: impl Into<String>) -> Self {
        Self {
            bundle_id: bundle_id.into(),
            dump_id: dump_id.into(),
        }
    }
}

impl fmt::Display for DumpIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bundle_id, self.dump_id)
    }
}

impl FromStr for DumpIdentifier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(bundle), Some(dump), None) if !bundle.is_empty() && !dump.is_empty() => {
                Ok(Self::new(bundle, dump))
            }
            _ => Err(anyhow::anyhow!(
                "invalid dump identifier '{s}', expected 'bundle:dump'"
            )),
        }
    }
}

// Serialized as a plain "bundle:dump" string so it can key JSON maps.
impl Serialize for DumpIdentifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DumpIdentifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Lifecycle of a dump as seen by readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DumpStatus {
    Created,
    Analyzing,
    Succeeded,
    Failed,
}

impl DumpStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DumpStatus::Succeeded | DumpStatus::Failed)
    }
}

impl fmt::Display for DumpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DumpStatus::Created => write!(f, "created"),
            DumpStatus::Analyzing => write!(f, "analyzing"),
            DumpStatus::Succeeded => write!(f, "succeeded"),
            DumpStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Kind of file a dump was created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DumpType {
    /// `*.dmp` user-space minidump or full dump
    WindowsDump,
    /// `*.core` / `*.core.gz`
    LinuxCoreDump,
    /// Placeholder for a bundle without analyzable files
    Empty,
}

/// Per-dump record. Mutated only by the pipeline through the dump repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpMetainfo {
    pub id: DumpIdentifier,
    pub dump_type: DumpType,
    /// Original file name, informational.
    #[serde(default)]
    pub dump_file_name: Option<String>,
    /// Location of the primary dump file, if any.
    #[serde(default)]
    pub dump_file: Option<PathBuf>,
    pub status: DumpStatus,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub finished: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl DumpMetainfo {
    pub fn new(id: DumpIdentifier, dump_type: DumpType, created: DateTime<Utc>) -> Self {
        Self {
            id,
            dump_type,
            dump_file_name: None,
            dump_file: None,
            status: DumpStatus::Created,
            created,
            finished: None,
            error_message: None,
            properties: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_display_and_parse() {
        let id = DumpIdentifier::new("bundle1", "dump2");
        assert_eq!(id.to_string(), "bundle1:dump2");
        assert_eq!("bundle1:dump2".parse::<DumpIdentifier>().unwrap(), id);
    }

    #[test]
    fn test_identifier_parse_rejects_malformed() {
        assert!("nocolon".parse::<DumpIdentifier>().is_err());
        assert!("a:b:c".parse::<DumpIdentifier>().is_err());
        assert!(":dump".parse::<DumpIdentifier>().is_err());
    }

    #[test]
    fn test_identifier_as_json_map_key() {
        let mut map = std::collections::HashMap::new();
        map.insert(DumpIdentifier::new("b", "d"), 0.5);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"b:d":0.5}"#);
        let back: std::collections::HashMap<DumpIdentifier, f64> =
            serde_json::from_str(&json).unwrap();
        assert_eq!(back[&DumpIdentifier::new("b", "d")], 0.5);
    }

    #[test]
    fn test_terminal_status() {
        assert!(!DumpStatus::Created.is_terminal());
        assert!(!DumpStatus::Analyzing.is_terminal());
        assert!(DumpStatus::Succeeded.is_terminal());
        assert!(DumpStatus::Failed.is_terminal());
    }
}
