//! Offline save/load of the mirror, in the same `{"state": {...}}` shape the
//! server sends.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::json::JsonValue;
use crate::path::StatePath;
use crate::store::StateStore;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid snapshot: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub state: BTreeMap<String, JsonValue>,
}

impl Snapshot {
    /// An empty game carrying only a server version.
    pub fn blank() -> Self {
        let mut state = BTreeMap::new();
        state.insert(
            "ScoreBoard.Version(release)".to_owned(),
            JsonValue::String("v2023.3".into()),
        );
        Self { state }
    }

    pub fn from_store(store: &StateStore) -> Self {
        Self {
            state: store
                .entries()
                .into_iter()
                .map(|(path, value)| (path.to_string(), value))
                .collect(),
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (StatePath, JsonValue)> + '_ {
        self.state
            .iter()
            .map(|(key, value)| (StatePath::parse(key), value.clone()))
    }

    /// Write every entry into `store`, broadcasting changes as usual.
    pub fn apply_to(&self, store: &StateStore) {
        store.apply(self.entries());
    }

    pub fn to_writer<W: Write>(&self, writer: W) -> Result<(), SnapshotError> {
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, SnapshotError> {
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        let file = std::fs::File::create(path)?;
        self.to_writer(std::io::BufWriter::new(file))
    }

    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file))
    }
}
