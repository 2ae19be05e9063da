//! Athlete registry: maps device ids to athlete metadata.
//!
//! Loaded from a JSON file at startup; devices without an entry get a
//! synthetic record so downstream payloads always carry a name.

use ahash::AHashMap;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use tracing::info;

/// Immutable record for a registered athlete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AthleteInfo {
    pub device_id: u32,
    pub athlete_id: String,
    pub name: String,
    pub team: String,
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    athletes: Vec<RegistryEntry>,
}

#[derive(Debug, Deserialize)]
struct RegistryEntry {
    device_id: u32,
    athlete_id: String,
    name: String,
    team: String,
}

/// Errors loading the registry file.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to read registry file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid registry JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// In-memory athlete registry with O(1) lookup by device id.
#[derive(Debug, Default)]
pub struct AthleteRegistry {
    by_device_id: AHashMap<u32, AthleteInfo>,
}

impl AthleteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load (or reload) the registry from a JSON file.
    pub fn load(&mut self, path: &Path) -> Result<usize, RegistryError> {
        info!(path = %path.display(), "Loading athlete registry");
        let raw = std::fs::read_to_string(path)?;
        let file: RegistryFile = serde_json::from_str(&raw)?;

        self.by_device_id.clear();
        for entry in file.athletes {
            self.by_device_id.insert(
                entry.device_id,
                AthleteInfo {
                    device_id: entry.device_id,
                    athlete_id: entry.athlete_id,
                    name: entry.name,
                    team: entry.team,
                },
            );
        }

        info!(count = self.by_device_id.len(), "Athlete registry loaded");
        Ok(self.by_device_id.len())
    }

    /// Look up an athlete by device id.
    pub fn get(&self, device_id: u32) -> Option<&AthleteInfo> {
        self.by_device_id.get(&device_id)
    }

    /// Look up an athlete, synthesizing an entry for unregistered devices.
    ///
    /// Tags (ids 1-99) get `T{nn}` identifiers matching the upstream tag
    /// naming; anything else falls back to a generic device record.
    pub fn get_or_default(&self, device_id: u32) -> AthleteInfo {
        if let Some(info) = self.by_device_id.get(&device_id) {
            return info.clone();
        }

        if (1..=99).contains(&device_id) {
            let tag_idx = device_id - 1;
            AthleteInfo {
                device_id,
                athlete_id: format!("T{tag_idx:02}"),
                name: format!("Tag {tag_idx}"),
                team: "UNKNOWN".to_string(),
            }
        } else {
            AthleteInfo {
                device_id,
                athlete_id: format!("DEV{device_id}"),
                name: format!("Device {device_id}"),
                team: "UNKNOWN".to_string(),
            }
        }
    }

    /// Number of registered athletes.
    pub fn count(&self) -> usize {
        self.by_device_id.len()
    }

    /// All registered athletes, sorted by device id.
    pub fn all_athletes(&self) -> Vec<AthleteInfo> {
        let mut athletes: Vec<_> = self.by_device_id.values().cloned().collect();
        athletes.sort_by_key(|a| a.device_id);
        athletes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_and_lookup() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"athletes": [
                {{"device_id": 1, "athlete_id": "HKG-01", "name": "A. Lee", "team": "HKG"}},
                {{"device_id": 2, "athlete_id": "HKG-02", "name": "B. Chan", "team": "HKG"}}
            ]}}"#
        )
        .unwrap();

        let mut registry = AthleteRegistry::new();
        let count = registry.load(file.path()).unwrap();
        assert_eq!(count, 2);
        assert_eq!(registry.get(1).unwrap().name, "A. Lee");
        assert!(registry.get(3).is_none());
    }

    #[test]
    fn test_synthetic_tag_fallback() {
        let registry = AthleteRegistry::new();
        let info = registry.get_or_default(1);
        assert_eq!(info.athlete_id, "T00");
        assert_eq!(info.name, "Tag 0");
        assert_eq!(info.team, "UNKNOWN");

        let info = registry.get_or_default(12);
        assert_eq!(info.athlete_id, "T11");
    }

    #[test]
    fn test_synthetic_device_fallback() {
        let registry = AthleteRegistry::new();
        let info = registry.get_or_default(150);
        assert_eq!(info.athlete_id, "DEV150");
        assert_eq!(info.name, "Device 150");
    }

    #[test]
    fn test_missing_file_is_error() {
        let mut registry = AthleteRegistry::new();
        let result = registry.load(Path::new("/nonexistent/athletes.json"));
        assert!(matches!(result, Err(RegistryError::Io(_))));
    }

    #[test]
    fn test_all_athletes_sorted() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"athletes": [
                {{"device_id": 5, "athlete_id": "X", "name": "X", "team": "T"}},
                {{"device_id": 2, "athlete_id": "Y", "name": "Y", "team": "T"}}
            ]}}"#
        )
        .unwrap();

        let mut registry = AthleteRegistry::new();
        registry.load(file.path()).unwrap();
        let ids: Vec<u32> = registry.all_athletes().iter().map(|a| a.device_id).collect();
        assert_eq!(ids, vec![2, 5]);
    }
}
