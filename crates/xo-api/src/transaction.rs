use std::fmt;

use serde::{Deserialize, Serialize};

/// Propagation attribute applied by the transaction interceptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionAttribute {
    /// Run without touching the ambient transaction.
    None,
    /// Join the active transaction; fail if there is none.
    Mandatory,
    /// Join the active transaction or begin (and complete) a new one.
    #[default]
    Requires,
}

/// Lifecycle of an XO transaction.
///
/// ```text
/// NotActive -> Active -> Committing -> Committed
///                    \-> RollingBack -> RolledBack
/// ```
///
/// `Committed` and `RolledBack` are terminal for one unit of work; `begin`
/// moves them back to `Active`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransactionState {
    NotActive,
    Active,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

impl TransactionState {
    /// Whether work issued now joins an open transaction.
    ///
    /// `Committing` counts as active so that synchronizations can still read
    /// and flush managed instances before the datastore commits.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Active | Self::Committing)
    }

    /// Whether `begin` is legal from this state.
    pub fn can_begin(self) -> bool {
        matches!(self, Self::NotActive | Self::Committed | Self::RolledBack)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotActive => "NOT_ACTIVE",
            Self::Active => "ACTIVE",
            Self::Committing => "COMMITTING",
            Self::Committed => "COMMITTED",
            Self::RollingBack => "ROLLING_BACK",
            Self::RolledBack => "ROLLED_BACK",
        };
        f.write_str(name)
    }
}
