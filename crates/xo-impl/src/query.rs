//! Query construction, parameter binding and result rows.
//!
//! Parameters that are managed instances are passed to the datastore as
//! record references ([`Value::Entity`] / [`Value::Relation`]). Results
//! are forward only; each row fetch runs through the interceptor chain.

use std::collections::BTreeMap;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use xo_api::{FromValue, Value, XoError, XoResult};
use xo_spi::{Entity, Record, Relation, ResultIterator, Row};

use crate::instance::{CompositeObject, EntityInstance, EntityProxy, ManagedObject, RelationInstance};
use crate::proxy::Argument;
use crate::session::SessionContext;
use crate::sync::SharedCursor;

/// A query ready to be bound and executed.
pub struct XoQuery {
    session: Weak<SessionContext>,
    expression: String,
    result_types: Vec<String>,
    columns: Option<Vec<String>>,
    parameters: BTreeMap<String, Argument>,
}

impl XoQuery {
    pub(crate) fn new(
        session: Weak<SessionContext>,
        expression: impl Into<String>,
        result_types: Vec<String>,
        columns: Option<Vec<String>>,
    ) -> Self {
        Self {
            session,
            expression: expression.into(),
            result_types,
            columns,
            parameters: BTreeMap::new(),
        }
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Declared types of the result rows.
    pub fn result_types(&self) -> &[String] {
        &self.result_types
    }

    /// Bind `name`. Binding the same name twice fails.
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Argument>) -> XoResult<Self> {
        let name = name.into();
        if self.parameters.contains_key(&name) {
            return Err(XoError::DuplicateParameter(name));
        }
        self.parameters.insert(name, value.into());
        Ok(self)
    }

    /// Bind several parameters at once, merged per name with the ones
    /// already bound. Each name must still be unbound.
    pub fn with_parameters<K, V>(mut self, parameters: impl IntoIterator<Item = (K, V)>) -> XoResult<Self>
    where
        K: Into<String>,
        V: Into<Argument>,
    {
        for (name, value) in parameters {
            self = self.with_parameter(name, value)?;
        }
        Ok(self)
    }

    fn session(&self) -> XoResult<Rc<SessionContext>> {
        let session = self.session.upgrade().ok_or(XoError::SessionClosed)?;
        session.ensure_open()?;
        Ok(session)
    }

    fn parameter_value(session: &SessionContext, argument: &Argument) -> XoResult<Value> {
        let entity = |instance: &EntityInstance| -> XoResult<Value> {
            let record = session.entity_instances().get_datastore_type(instance)?;
            Ok(Value::Entity(record.id().clone()))
        };
        match argument {
            Argument::Value(value) => Ok(value.clone()),
            Argument::Entity(None) => Ok(Value::Null),
            Argument::Entity(Some(instance)) => entity(instance),
            Argument::Entities(instances) => Ok(Value::List(
                instances.iter().map(entity).collect::<XoResult<_>>()?,
            )),
            Argument::Object(ManagedObject::Entity(instance)) => entity(instance),
            Argument::Object(ManagedObject::Relation(instance)) => {
                let record = session.relation_instances().get_datastore_type(instance)?;
                Ok(Value::Relation(record.id().clone()))
            }
        }
    }

    /// Run the query.
    pub fn execute(&self) -> XoResult<QueryResult> {
        let session = self.session()?;
        let parameters = self
            .parameters
            .iter()
            .map(|(name, argument)| Ok((name.clone(), Self::parameter_value(&session, argument)?)))
            .collect::<XoResult<BTreeMap<String, Value>>>()?;
        let cursor = session.intercept("execute", || {
            Ok(session
                .datastore()
                .execute_query(&self.expression, &parameters)?)
        })?;
        let cursor = Rc::new(RefCell::new(cursor));
        session.track_cursor(&cursor);
        Ok(QueryResult {
            session: self.session.clone(),
            cursor,
            columns: self.columns.clone(),
            done: false,
        })
    }
}

impl fmt::Debug for XoQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XoQuery")
            .field("expression", &self.expression)
            .field("result_types", &self.result_types)
            .field("parameters", &self.parameters.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Forward only sequence of result rows.
///
/// Dropping or closing the result releases the datastore cursor, and so
/// does the completion of the transaction it was opened in.
pub struct QueryResult {
    session: Weak<SessionContext>,
    cursor: SharedCursor<Row>,
    columns: Option<Vec<String>>,
    done: bool,
}

impl QueryResult {
    pub fn close(&mut self) {
        self.done = true;
        self.cursor.borrow_mut().close();
    }

    /// The only row of the result.
    pub fn single(mut self) -> XoResult<ResultRow> {
        let first = match self.next() {
            Some(row) => row?,
            None => return Err(XoError::NotSingleResult("0 rows".into())),
        };
        if self.next().is_some() {
            self.close();
            return Err(XoError::NotSingleResult("more than one row".into()));
        }
        self.close();
        Ok(first)
    }

    fn fetch(&mut self) -> XoResult<Option<Row>> {
        let session = self.session.upgrade().ok_or(XoError::SessionClosed)?;
        session.ensure_open()?;
        let cursor = &self.cursor;
        session.intercept("next", || Ok(cursor.borrow_mut().next()))
    }
}

impl Iterator for QueryResult {
    type Item = XoResult<ResultRow>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.fetch() {
            Ok(Some(row)) => Some(Ok(ResultRow {
                session: self.session.clone(),
                row,
                columns: self.columns.clone(),
            })),
            Ok(None) => {
                self.close();
                None
            }
            Err(e) => {
                self.close();
                Some(Err(e))
            }
        }
    }
}

/// One result row with named column access.
pub struct ResultRow {
    session: Weak<SessionContext>,
    row: Row,
    columns: Option<Vec<String>>,
}

impl ResultRow {
    pub fn columns(&self) -> Vec<&str> {
        match &self.columns {
            Some(columns) => columns.iter().map(String::as_str).collect(),
            None => self.row.keys().map(String::as_str).collect(),
        }
    }

    /// Raw value of `column`. A present column may hold null.
    pub fn get(&self, column: &str) -> XoResult<&Value> {
        if let Some(columns) = &self.columns {
            if !columns.iter().any(|c| c == column) {
                return Err(XoError::ColumnNotFound(column.to_string()));
            }
        }
        self.row
            .get(column)
            .ok_or_else(|| XoError::ColumnNotFound(column.to_string()))
    }

    /// Value of `column` converted to `T`; null reads as `None`.
    pub fn get_as<T: FromValue>(&self, column: &str) -> XoResult<Option<T>> {
        let value = self.get(column)?;
        if value.is_null() {
            return Ok(None);
        }
        T::from_value(value)
            .map(Some)
            .ok_or_else(|| XoError::ColumnType {
                column: column.to_string(),
                expected: T::TYPE_NAME.to_string(),
                actual: value.type_name().to_string(),
            })
    }

    fn session(&self) -> XoResult<Rc<SessionContext>> {
        let session = self.session.upgrade().ok_or(XoError::SessionClosed)?;
        session.ensure_open()?;
        Ok(session)
    }

    pub fn get_entity(&self, column: &str) -> XoResult<Option<EntityInstance>> {
        match self.get(column)? {
            Value::Null => Ok(None),
            Value::Entity(id) => {
                let session = self.session()?;
                let instance = session
                    .intercept("getEntity", || session.entity_instances().get_instance(&Entity::new(id.clone())))?;
                Ok(Some(instance))
            }
            other => Err(XoError::ColumnType {
                column: column.to_string(),
                expected: "entity".into(),
                actual: other.type_name().to_string(),
            }),
        }
    }

    pub fn get_relation(&self, column: &str) -> XoResult<Option<RelationInstance>> {
        match self.get(column)? {
            Value::Null => Ok(None),
            Value::Relation(id) => {
                let session = self.session()?;
                let instance = session.intercept("getRelation", || {
                    session
                        .relation_instances()
                        .get_instance(&Relation::new(id.clone()))
                })?;
                Ok(Some(instance))
            }
            other => Err(XoError::ColumnType {
                column: column.to_string(),
                expected: "relation".into(),
                actual: other.type_name().to_string(),
            }),
        }
    }

    fn single_column(&self) -> XoResult<&str> {
        let columns = self.columns();
        match columns.as_slice() {
            [column] => Ok(*column),
            _ => Err(XoError::invalid_argument(
                "as_type",
                format!("row has {} columns, expected one", columns.len()),
            )),
        }
    }

    /// The record held by the only column of the row.
    pub fn object(&self) -> XoResult<CompositeObject> {
        let column = self.single_column()?;
        let object = match self.get(column)? {
            Value::Relation(_) => self.get_relation(column)?.map(CompositeObject::new),
            _ => self.get_entity(column)?.map(CompositeObject::new),
        };
        object.ok_or_else(|| XoError::ColumnType {
            column: column.to_string(),
            expected: "entity or relation".into(),
            actual: "null".into(),
        })
    }

    /// The entity of a single column row as proxy type `T`.
    pub fn as_type<T: EntityProxy>(&self) -> XoResult<T> {
        self.object()?.as_type()
    }
}

impl fmt::Debug for ResultRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.row.iter()).finish()
    }
}
