use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;
use xo_api::{DatastoreError, DatastoreResult, RecordId, Value};

/// One entity as stored on disk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub types: BTreeSet<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

impl Document {
    /// A fresh document with a time-ordered id.
    pub fn new(types: BTreeSet<String>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            types,
            properties: BTreeMap::new(),
        }
    }
}

/// Directory holding one `<id>.json` file per document.
#[derive(Clone, Debug)]
pub struct DocumentDirectory {
    root: PathBuf,
}

impl DocumentDirectory {
    pub fn open(root: impl Into<PathBuf>) -> DatastoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate a record id and return its canonical document id.
    pub fn document_id(id: &RecordId) -> DatastoreResult<String> {
        match id {
            RecordId::Text(text) => Uuid::parse_str(text)
                .map(|uuid| uuid.to_string())
                .map_err(|_| DatastoreError::RecordNotFound(id.clone())),
            RecordId::Numeric(_) => Err(DatastoreError::RecordNotFound(id.clone())),
        }
    }

    fn path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    pub fn read(&self, id: &str) -> DatastoreResult<Option<Document>> {
        let bytes = match fs::read(self.path(id)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| DatastoreError::Serialization(format!("document {id}: {e}")))
    }

    pub fn write(&self, document: &Document) -> DatastoreResult<()> {
        let bytes = serde_json::to_vec_pretty(document)
            .map_err(|e| DatastoreError::Serialization(e.to_string()))?;
        let path = self.path(&document.id);
        fs::write(&path, bytes)?;
        debug!(id = %document.id, path = %path.display(), "document written");
        Ok(())
    }

    pub fn remove(&self, id: &str) -> DatastoreResult<()> {
        match fs::remove_file(self.path(id)) {
            Ok(()) => {
                debug!(id, "document removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Every readable document in the directory, ordered by id.
    ///
    /// Files that fail to parse are skipped with a warning.
    pub fn scan(&self) -> DatastoreResult<Vec<Document>> {
        let mut documents = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.read(id) {
                Ok(Some(document)) => documents.push(document),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable document"),
            }
        }
        documents.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(documents)
    }
}
