//! Session transaction state machine with completion callbacks.
//!
//! ```text
//! NotActive --begin--> Active --commit--> Committing --> Committed
//!                         \                    \
//!                          rollback             before_completion failed
//!                           \                    \
//!                            RollingBack ------> RolledBack
//! ```
//!
//! Default synchronizations (cache flush, validation) stay registered for
//! the life of the session. Synchronizations registered through
//! [`XoTransaction::register_synchronization`] apply to the current
//! transaction only. Both run in registration order, defaults first.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::{debug, warn};
use xo_api::{TransactionState, XoError, XoResult};
use xo_spi::DatastoreSession;

/// Listener on the completion of a transaction.
pub trait Synchronization {
    /// Short name used in log output.
    fn name(&self) -> &str;

    /// Runs before the native commit. An error aborts the commit and rolls
    /// the transaction back.
    fn before_completion(&self) -> XoResult<()>;

    /// Runs once the outcome is known.
    fn after_completion(&self, committed: bool);
}

/// The ambient transaction of one session.
pub struct XoTransaction {
    datastore: Rc<dyn DatastoreSession>,
    state: Cell<TransactionState>,
    defaults: RefCell<Vec<Rc<dyn Synchronization>>>,
    synchronizations: RefCell<Vec<Rc<dyn Synchronization>>>,
}

impl XoTransaction {
    pub(crate) fn new(datastore: Rc<dyn DatastoreSession>) -> Self {
        Self {
            datastore,
            state: Cell::new(TransactionState::NotActive),
            defaults: RefCell::new(Vec::new()),
            synchronizations: RefCell::new(Vec::new()),
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state.get()
    }

    pub fn is_active(&self) -> bool {
        self.state.get().is_active()
    }

    pub fn begin(&self) -> XoResult<()> {
        let state = self.state.get();
        if !state.can_begin() {
            return Err(XoError::TransactionState(format!(
                "cannot begin a transaction while {state}"
            )));
        }
        self.datastore.transaction().begin()?;
        self.state.set(TransactionState::Active);
        debug!("transaction begin");
        Ok(())
    }

    pub fn commit(&self) -> XoResult<()> {
        let state = self.state.get();
        if state != TransactionState::Active {
            return Err(XoError::TransactionState(format!(
                "cannot commit a transaction while {state}"
            )));
        }
        self.state.set(TransactionState::Committing);
        let synchronizations = self.snapshot();

        for synchronization in &synchronizations {
            if let Err(e) = synchronization.before_completion() {
                warn!(
                    synchronization = synchronization.name(),
                    error = %e,
                    "before completion failed; rolling back"
                );
                if let Err(rollback) = self.datastore.transaction().rollback() {
                    warn!(error = %rollback, "native rollback failed");
                }
                self.complete(&synchronizations, false);
                return Err(e);
            }
        }

        if let Err(e) = self.datastore.transaction().commit() {
            warn!(error = %e, "native commit failed");
            if self.datastore.transaction().is_active() {
                if let Err(rollback) = self.datastore.transaction().rollback() {
                    warn!(error = %rollback, "native rollback failed");
                }
            }
            self.complete(&synchronizations, false);
            return Err(e.into());
        }
        self.complete(&synchronizations, true);
        debug!("transaction committed");
        Ok(())
    }

    pub fn rollback(&self) -> XoResult<()> {
        let state = self.state.get();
        if !state.is_active() {
            return Err(XoError::TransactionState(format!(
                "cannot roll back a transaction while {state}"
            )));
        }
        self.state.set(TransactionState::RollingBack);
        let synchronizations = self.snapshot();
        let result = self.datastore.transaction().rollback();
        self.complete(&synchronizations, false);
        debug!("transaction rolled back");
        Ok(result?)
    }

    /// Register a synchronization for every transaction of the session.
    pub(crate) fn register_default_synchronization(&self, synchronization: Rc<dyn Synchronization>) {
        self.defaults.borrow_mut().push(synchronization);
    }

    /// Register a synchronization for the current transaction only.
    pub fn register_synchronization(&self, synchronization: Rc<dyn Synchronization>) {
        self.synchronizations.borrow_mut().push(synchronization);
    }

    fn snapshot(&self) -> Vec<Rc<dyn Synchronization>> {
        self.defaults
            .borrow()
            .iter()
            .chain(self.synchronizations.borrow().iter())
            .cloned()
            .collect()
    }

    fn complete(&self, synchronizations: &[Rc<dyn Synchronization>], committed: bool) {
        self.state.set(if committed {
            TransactionState::Committed
        } else {
            TransactionState::RolledBack
        });
        for synchronization in synchronizations {
            synchronization.after_completion(committed);
        }
        self.synchronizations.borrow_mut().clear();
    }
}
