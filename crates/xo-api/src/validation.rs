use std::fmt;

use serde::{Deserialize, Serialize};

/// Whether a violation prevents the transaction from committing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Blocking,
    Warning,
}

/// One failed constraint on a managed instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintViolation {
    /// Description of the failed constraint.
    pub message: String,
    /// The offending property, if the constraint is property scoped.
    pub property: Option<String>,
    /// Rendering of the offending instance (filled in by the validator).
    pub instance: Option<String>,
    pub severity: Severity,
}

impl ConstraintViolation {
    /// A violation that aborts commit.
    pub fn blocking(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            property: None,
            instance: None,
            severity: Severity::Blocking,
        }
    }

    /// A violation that is reported but does not abort commit.
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::blocking(message)
        }
    }

    /// Attach the property the violation refers to.
    pub fn on_property(mut self, property: impl Into<String>) -> Self {
        self.property = Some(property.into());
        self
    }

    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Blocking
    }
}

impl fmt::Display for ConstraintViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(instance) = &self.instance {
            write!(f, "{instance}: ")?;
        }
        if let Some(property) = &self.property {
            write!(f, "{property} ")?;
        }
        f.write_str(&self.message)
    }
}

/// Whether constraint validation runs before commit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    None,
    #[default]
    Auto,
}
