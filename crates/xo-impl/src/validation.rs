//! Constraint validation of cached instances.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use xo_api::{ConstraintViolation, XoResult};

use crate::cache::TransactionalCache;
use crate::instance::{EntityInstance, ManagedObject, RelationInstance};

/// User supplied constraint check for one managed object.
pub trait ConstraintValidator: Send + Sync {
    fn validate(&self, object: &ManagedObject) -> XoResult<Vec<ConstraintViolation>>;
}

impl<F> ConstraintValidator for F
where
    F: Fn(&ManagedObject) -> XoResult<Vec<ConstraintViolation>> + Send + Sync,
{
    fn validate(&self, object: &ManagedObject) -> XoResult<Vec<ConstraintViolation>> {
        self(object)
    }
}

/// Runs every registered validator over the instances of the current
/// transaction, relations first.
pub struct InstanceValidator {
    entity_cache: Rc<RefCell<TransactionalCache<EntityInstance>>>,
    relation_cache: Rc<RefCell<TransactionalCache<RelationInstance>>>,
    validators: Vec<Arc<dyn ConstraintValidator>>,
}

impl InstanceValidator {
    pub(crate) fn new(
        entity_cache: Rc<RefCell<TransactionalCache<EntityInstance>>>,
        relation_cache: Rc<RefCell<TransactionalCache<RelationInstance>>>,
        validators: Vec<Arc<dyn ConstraintValidator>>,
    ) -> Self {
        Self {
            entity_cache,
            relation_cache,
            validators,
        }
    }

    pub fn validate(&self) -> XoResult<Vec<ConstraintViolation>> {
        if self.validators.is_empty() {
            return Ok(Vec::new());
        }
        // Snapshots: validators may read properties, which can touch the caches.
        let relations = self.relation_cache.borrow().values();
        let entities = self.entity_cache.borrow().values();
        let objects = relations
            .into_iter()
            .map(ManagedObject::Relation)
            .chain(entities.into_iter().map(ManagedObject::Entity));

        let mut violations = Vec::new();
        for object in objects {
            for validator in &self.validators {
                for mut violation in validator.validate(&object)? {
                    violation
                        .instance
                        .get_or_insert_with(|| object.to_string());
                    violations.push(violation);
                }
            }
        }
        Ok(violations)
    }
}
