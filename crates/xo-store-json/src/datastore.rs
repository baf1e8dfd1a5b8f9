use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;
use xo_api::{DatastoreError, DatastoreResult};
use xo_spi::{Datastore, DatastoreEntityMetadata, DatastoreRelationMetadata, DatastoreSession};

use crate::document::DocumentDirectory;
use crate::session::JsonFileSession;

/// Unit property naming the document directory.
pub const DIRECTORY_PROPERTY: &str = "xo.json.directory";

/// Document datastore keeping one JSON file per entity.
pub struct JsonFileDatastore {
    directory: DocumentDirectory,
}

impl JsonFileDatastore {
    /// Open a store in `directory`, creating it if needed.
    pub fn new(directory: impl Into<PathBuf>) -> DatastoreResult<Self> {
        Ok(Self {
            directory: DocumentDirectory::open(directory)?,
        })
    }

    /// Open a store from unit properties (`xo.json.directory`).
    pub fn from_properties(properties: &BTreeMap<String, String>) -> DatastoreResult<Self> {
        let directory = properties.get(DIRECTORY_PROPERTY).ok_or_else(|| {
            DatastoreError::Backend(format!("missing unit property '{DIRECTORY_PROPERTY}'"))
        })?;
        Self::new(directory)
    }

    pub fn directory(&self) -> &Path {
        self.directory.root()
    }
}

impl Datastore for JsonFileDatastore {
    fn init(
        &self,
        entities: &[DatastoreEntityMetadata],
        relations: &[DatastoreRelationMetadata],
    ) -> DatastoreResult<()> {
        if !relations.is_empty() {
            tracing::warn!(
                relations = relations.len(),
                "json file datastore ignores relation types"
            );
        }
        debug!(
            directory = %self.directory.root().display(),
            entities = entities.len(),
            "json file datastore initialized"
        );
        Ok(())
    }

    fn create_session(&self) -> DatastoreResult<Box<dyn DatastoreSession>> {
        Ok(Box::new(JsonFileSession::new(self.directory.clone())))
    }

    fn close(&self) -> DatastoreResult<()> {
        Ok(())
    }
}
