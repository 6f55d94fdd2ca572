use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

/// Lookup into the known-malware database. The database itself is maintained
/// elsewhere; this side only asks one question.
pub trait MalwareOracle: Send + Sync {
    fn is_malware(&self, name: &str, version: &str) -> bool;
}

#[derive(Debug)]
pub enum OracleError {
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl fmt::Display for OracleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OracleError::Io(error) => write!(f, "failed to read malware database: {}", error),
            OracleError::Parse(error) => write!(f, "failed to parse malware database: {}", error),
        }
    }
}

impl std::error::Error for OracleError {}

impl From<std::io::Error> for OracleError {
    fn from(value: std::io::Error) -> Self {
        OracleError::Io(value)
    }
}

impl From<serde_json::Error> for OracleError {
    fn from(value: serde_json::Error) -> Self {
        OracleError::Parse(value)
    }
}

/// In-memory dataset keyed by package name. A `"*"` version entry marks the
/// whole package as malicious.
#[derive(Debug, Default)]
pub struct DatasetOracle {
    entries: HashMap<String, HashSet<String>>,
}

impl DatasetOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON document of the shape `{"package": ["1.0.0", "*"], ...}`.
    pub fn load(path: &Path) -> Result<Self, OracleError> {
        let raw = std::fs::read(path)?;
        let parsed: HashMap<String, Vec<String>> = serde_json::from_slice(&raw)?;
        let mut oracle = DatasetOracle::new();
        for (name, versions) in parsed {
            for version in versions {
                oracle.insert(&name, &version);
            }
        }
        Ok(oracle)
    }

    pub fn insert(&mut self, name: &str, version: &str) {
        self.entries
            .entry(name.to_string())
            .or_default()
            .insert(version.to_string());
    }
}

impl MalwareOracle for DatasetOracle {
    fn is_malware(&self, name: &str, version: &str) -> bool {
        match self.entries.get(name) {
            Some(versions) => versions.contains("*") || versions.contains(version),
            None => false,
        }
    }
}
