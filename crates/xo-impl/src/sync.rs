//! Synchronizations registered on every session transaction.
//!
//! Registration order is validator, entity cache, relation cache, cursors,
//! so that relations are flushed after the entities they connect.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::{debug, warn};
use xo_api::{ValidationMode, XoError, XoResult};
use xo_spi::{DatastoreSession, Entity, Relation, ResultIterator};

use crate::cache::TransactionalCache;
use crate::instance::{Instance, InstanceManager, ManagedRecord};
use crate::transaction::Synchronization;
use crate::validation::InstanceValidator;

/// Flushes the cached instances of one record kind before commit and
/// resets the cache afterwards.
pub struct CacheSynchronization<R: ManagedRecord> {
    name: &'static str,
    cache: Rc<RefCell<TransactionalCache<Instance<R>>>>,
    manager: Rc<InstanceManager<R>>,
    datastore: Rc<dyn DatastoreSession>,
}

pub type EntityCacheSynchronization = CacheSynchronization<Entity>;
pub type RelationCacheSynchronization = CacheSynchronization<Relation>;

impl<R: ManagedRecord> CacheSynchronization<R> {
    pub(crate) fn new(
        name: &'static str,
        manager: Rc<InstanceManager<R>>,
        datastore: Rc<dyn DatastoreSession>,
    ) -> Self {
        Self {
            name,
            cache: manager.cache().clone(),
            manager,
            datastore,
        }
    }

    /// Flush every cached instance once. Returns the number flushed.
    pub fn flush(&self) -> XoResult<usize> {
        let instances = self.cache.borrow().values();
        for instance in &instances {
            let record = self.manager.get_datastore_type(instance)?;
            R::flush(self.datastore.as_ref(), &record)?;
        }
        debug!(kind = R::KIND, flushed = instances.len(), "cache flushed");
        Ok(instances.len())
    }
}

impl<R: ManagedRecord> Synchronization for CacheSynchronization<R> {
    fn name(&self) -> &str {
        self.name
    }

    fn before_completion(&self) -> XoResult<()> {
        self.flush().map(|_| ())
    }

    /// Resets the cache. On rollback, instances whose record vanished or
    /// changed its types are retired.
    fn after_completion(&self, committed: bool) {
        if !committed {
            let instances = self.cache.borrow().values();
            let retired = instances
                .iter()
                .filter(|instance| self.manager.retire_if_stale(instance))
                .count();
            if retired > 0 {
                debug!(kind = R::KIND, retired, "instances retired on rollback");
            }
        }
        self.cache.borrow_mut().after_completion(committed);
    }
}

/// Validates cached instances before commit.
///
/// Blocking violations abort the commit, warnings are logged.
pub struct ValidatorSynchronization {
    validator: Rc<InstanceValidator>,
    mode: ValidationMode,
}

impl ValidatorSynchronization {
    pub(crate) fn new(validator: Rc<InstanceValidator>, mode: ValidationMode) -> Self {
        Self { validator, mode }
    }
}

impl Synchronization for ValidatorSynchronization {
    fn name(&self) -> &str {
        "validator"
    }

    fn before_completion(&self) -> XoResult<()> {
        if self.mode == ValidationMode::None {
            return Ok(());
        }
        let (blocking, warnings): (Vec<_>, Vec<_>) = self
            .validator
            .validate()?
            .into_iter()
            .partition(|violation| violation.is_blocking());
        for violation in &warnings {
            warn!(violation = %violation, "constraint warning");
        }
        if blocking.is_empty() {
            Ok(())
        } else {
            Err(XoError::ConstraintViolations(blocking))
        }
    }

    fn after_completion(&self, _committed: bool) {}
}

/// A datastore cursor shared between a result and the session.
pub(crate) type SharedCursor<T> = Rc<RefCell<Box<dyn ResultIterator<Item = T>>>>;

/// Something the session can close from outside.
pub(crate) trait CloseCursor {
    fn close_cursor(&self);
}

impl<T: 'static> CloseCursor for RefCell<Box<dyn ResultIterator<Item = T>>> {
    fn close_cursor(&self) {
        if let Ok(mut cursor) = self.try_borrow_mut() {
            cursor.close();
        }
    }
}

/// Closes the result cursors opened inside a transaction once it completes.
#[derive(Default)]
pub struct CursorSynchronization {
    cursors: RefCell<Vec<Weak<dyn CloseCursor>>>,
}

impl CursorSynchronization {
    pub(crate) fn track(&self, cursor: Weak<dyn CloseCursor>) {
        let mut cursors = self.cursors.borrow_mut();
        cursors.retain(|c| c.strong_count() > 0);
        cursors.push(cursor);
    }

    /// Cursors still held by an unconsumed result.
    pub fn open(&self) -> usize {
        self.cursors
            .borrow()
            .iter()
            .filter(|c| c.strong_count() > 0)
            .count()
    }
}

impl Synchronization for CursorSynchronization {
    fn name(&self) -> &str {
        "cursors"
    }

    fn before_completion(&self) -> XoResult<()> {
        Ok(())
    }

    fn after_completion(&self, _committed: bool) {
        let cursors = std::mem::take(&mut *self.cursors.borrow_mut());
        let mut closed = 0;
        for cursor in cursors.iter().filter_map(Weak::upgrade) {
            cursor.close_cursor();
            closed += 1;
        }
        if closed > 0 {
            debug!(closed, "cursors closed at transaction end");
        }
    }
}
