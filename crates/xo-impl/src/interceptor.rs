//! Interceptor chain wrapped around every managed operation.
//!
//! Proxy invocations, collection view operations, manager operations and
//! query iteration all pass through the session's [`InterceptorChain`].
//! The [`TransactionInterceptor`] is always the outermost element; user
//! interceptors run inside the ambient transaction it establishes.

use std::rc::Rc;

use tracing::{debug, warn};
use xo_api::{TransactionAttribute, XoError, XoResult};

use crate::transaction::XoTransaction;

/// What is being invoked.
#[derive(Clone, Copy, Debug)]
pub struct InvocationContext<'a> {
    /// Method or operation name, e.g. `getName` or `find`.
    pub operation: &'a str,
    pub attribute: TransactionAttribute,
}

/// One element of the chain.
///
/// `intercept` must call `proceed` at most once. Not calling it skips the
/// operation and every interceptor after this one.
pub trait Interceptor {
    fn name(&self) -> &str;

    fn intercept(
        &self,
        context: &InvocationContext<'_>,
        proceed: &mut dyn FnMut() -> XoResult<()>,
    ) -> XoResult<()>;
}

/// Ordered interceptors; the first one is outermost.
#[derive(Default)]
pub struct InterceptorChain {
    interceptors: Vec<Box<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new(interceptors: Vec<Box<dyn Interceptor>>) -> Self {
        Self { interceptors }
    }

    pub fn push(&mut self, interceptor: Box<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    /// Run `operation` through every interceptor.
    pub fn invoke<T>(
        &self,
        context: &InvocationContext<'_>,
        operation: impl FnOnce() -> XoResult<T>,
    ) -> XoResult<T> {
        let mut operation = Some(operation);
        let mut output = None;
        self.run(0, context, &mut || {
            let operation = operation.take().ok_or_else(|| {
                XoError::invalid_argument(context.operation, "interceptor proceeded twice")
            })?;
            output = Some(operation()?);
            Ok(())
        })?;
        output.ok_or_else(|| {
            XoError::invalid_argument(context.operation, "operation was skipped by an interceptor")
        })
    }

    fn run(
        &self,
        index: usize,
        context: &InvocationContext<'_>,
        target: &mut dyn FnMut() -> XoResult<()>,
    ) -> XoResult<()> {
        match self.interceptors.get(index) {
            None => target(),
            Some(interceptor) => {
                interceptor.intercept(context, &mut || self.run(index + 1, context, &mut *target))
            }
        }
    }
}

/// Applies the [`TransactionAttribute`] of an invocation.
///
/// - `None` runs the operation as is.
/// - `Mandatory` fails with [`XoError::NoActiveTransaction`] outside a
///   transaction.
/// - `Requires` joins the active transaction or runs the operation in a
///   new one, committed on success and rolled back on failure.
pub struct TransactionInterceptor {
    transaction: Rc<XoTransaction>,
}

impl TransactionInterceptor {
    pub fn new(transaction: Rc<XoTransaction>) -> Self {
        Self { transaction }
    }
}

impl Interceptor for TransactionInterceptor {
    fn name(&self) -> &str {
        "transaction"
    }

    fn intercept(
        &self,
        context: &InvocationContext<'_>,
        proceed: &mut dyn FnMut() -> XoResult<()>,
    ) -> XoResult<()> {
        match context.attribute {
            TransactionAttribute::None => proceed(),
            TransactionAttribute::Mandatory => {
                if !self.transaction.is_active() {
                    return Err(XoError::NoActiveTransaction);
                }
                proceed()
            }
            TransactionAttribute::Requires => {
                if self.transaction.is_active() {
                    return proceed();
                }
                debug!(operation = context.operation, "implicit transaction");
                self.transaction.begin()?;
                match proceed() {
                    Ok(()) => self.transaction.commit(),
                    Err(e) => {
                        if self.transaction.is_active() {
                            if let Err(rollback) = self.transaction.rollback() {
                                warn!(
                                    operation = context.operation,
                                    error = %rollback,
                                    "implicit rollback failed"
                                );
                            }
                        }
                        Err(e)
                    }
                }
            }
        }
    }
}
