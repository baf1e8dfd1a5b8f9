use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{XoError, XoResult};
use crate::transaction::TransactionAttribute;
use crate::validation::ValidationMode;

/// Configuration of one XO unit: a datastore binding plus the policies every
/// session created from it shares.
///
/// ```toml
/// name = "library"
/// transaction_attribute = "mandatory"
/// validation_mode = "none"
///
/// [properties]
/// "xo.json.directory" = "/var/lib/library"
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct XoUnit {
    pub name: String,
    pub description: Option<String>,
    /// Propagation applied to intercepted calls without their own attribute.
    pub transaction_attribute: TransactionAttribute,
    pub validation_mode: ValidationMode,
    /// Datastore specific settings, passed through untouched.
    pub properties: BTreeMap<String, String>,
}

impl Default for XoUnit {
    fn default() -> Self {
        Self {
            name: "default".into(),
            description: None,
            transaction_attribute: TransactionAttribute::default(),
            validation_mode: ValidationMode::default(),
            properties: BTreeMap::new(),
        }
    }
}

impl XoUnit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Parse a unit from its TOML representation.
    pub fn from_toml_str(source: &str) -> XoResult<Self> {
        let unit: Self = toml::from_str(source).map_err(|e| XoError::Config(e.to_string()))?;
        if unit.name.trim().is_empty() {
            return Err(XoError::Config("unit name must not be empty".into()));
        }
        Ok(unit)
    }

    pub fn with_transaction_attribute(mut self, attribute: TransactionAttribute) -> Self {
        self.transaction_attribute = attribute;
        self
    }

    pub fn with_validation_mode(mut self, mode: ValidationMode) -> Self {
        self.validation_mode = mode;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}
