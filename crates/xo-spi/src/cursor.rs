use std::collections::BTreeMap;

use xo_api::Value;

/// One row of a query result: column name to value.
pub type Row = BTreeMap<String, Value>;

/// Forward-only, closeable sequence of datastore results.
///
/// `close` releases the underlying cursor. Implementations must also
/// release it on drop and must yield nothing after `close`.
pub trait ResultIterator: Iterator {
    fn close(&mut self);
}

/// Cursor over results a datastore has already materialized.
///
/// An optional release hook runs exactly once, on `close` or on drop,
/// whichever comes first.
pub struct VecCursor<T> {
    items: std::vec::IntoIter<T>,
    on_close: Option<Box<dyn FnOnce()>>,
}

impl<T> VecCursor<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items: items.into_iter(),
            on_close: None,
        }
    }

    /// Attach a hook that releases the backing resource.
    pub fn on_close(mut self, hook: impl FnOnce() + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }

    fn release(&mut self) {
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

impl<T> Iterator for VecCursor<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.items.next()
    }
}

impl<T> ResultIterator for VecCursor<T> {
    fn close(&mut self) {
        self.items = Vec::new().into_iter();
        self.release();
    }
}

impl<T> Drop for VecCursor<T> {
    fn drop(&mut self) {
        self.release();
    }
}
