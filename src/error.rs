//! Error types and the exception bridge.
//!
//! Native failures become the engine's pending exception before control
//! returns to the engine ([`Error::throw`], [`guard`]). Failures reported by
//! the engine surface in Rust as [`Error::Exception`], which leaves the
//! exception value pending until someone asks for it.

use std::any::Any;
use std::ffi::c_int;
use std::fmt;
use std::panic::{self, AssertUnwindSafe, Location};
use std::rc::Weak;

use rquickjs::qjs;
use thiserror::Error;
use tracing::warn;

use crate::context::{Context, ContextInner};
use crate::raw::{self, ErrorKind};
use crate::value::Value;

/// Errors raised by the binding layer.
#[derive(Debug, Error)]
pub enum Error {
    /// A runtime value does not have the shape the native type expects.
    #[error("{0}")]
    TypeMismatch(String),

    /// A number does not fit the native type.
    #[error("{0}")]
    Range(String),

    /// An engine primitive reported failure.
    #[error("{0}")]
    RuntimeOperationFailed(String),

    /// A payload expected to be present was missing.
    #[error("{0}")]
    InternalInvariant(String),

    /// An exception is pending in the runtime.
    #[error(transparent)]
    Exception(#[from] Exception),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Error::TypeMismatch(message.into())
    }

    pub fn range(message: impl Into<String>) -> Self {
        Error::Range(message.into())
    }

    /// Make this error the pending exception of `ctx`. Returns the
    /// exception sentinel for native callbacks to hand back to the engine.
    ///
    /// An [`Error::Exception`] is already pending in its runtime and is left
    /// as is.
    pub fn throw(self, ctx: &Context) -> qjs::JSValue {
        self.throw_raw(ctx.raw())
    }

    pub(crate) fn throw_raw(self, ctx: *mut qjs::JSContext) -> qjs::JSValue {
        match self {
            Error::TypeMismatch(message) => raw::throw(ctx, ErrorKind::Type, &message),
            Error::Range(message) => raw::throw(ctx, ErrorKind::Range, &message),
            Error::Exception(exception) => exception.rethrow(ctx),
            other => raw::throw(ctx, ErrorKind::Internal, &other.to_string()),
        }
    }
}

/// A runtime exception surfaced in native code.
///
/// Records where it was raised; the exception value itself stays in the
/// runtime until [`Exception::value`] takes it.
pub struct Exception {
    ctx: Weak<ContextInner>,
    location: &'static Location<'static>,
}

impl Exception {
    #[track_caller]
    pub(crate) fn new(ctx: &Context) -> Self {
        Self {
            ctx: ctx.downgrade(),
            location: Location::caller(),
        }
    }

    /// Source location where the exception crossed into native code.
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    /// The context the exception is pending in, if it is still alive.
    pub fn context(&self) -> Option<Context> {
        Context::upgrade(&self.ctx)
    }

    /// Take the pending exception value, clearing it from the runtime.
    ///
    /// Returns `None` when the context is gone. A second call returns null.
    pub fn value(&self) -> Option<Value> {
        self.context().map(|ctx| ctx.get_exception())
    }

    /// Take the exception and convert it to text.
    pub fn message(&self) -> Option<String> {
        self.value().map(|value| value.to_string())
    }

    fn rethrow(self, ctx: *mut qjs::JSContext) -> qjs::JSValue {
        let Some(source) = self.context() else {
            return raw::throw(
                ctx,
                ErrorKind::Internal,
                "exception raised in a context that no longer exists",
            );
        };
        // The pending exception belongs to the runtime, not the context.
        if source.runtime().raw() != unsafe { qjs::JS_GetRuntime(ctx) } {
            return raw::throw(ctx, ErrorKind::Internal, "exception raised in another runtime");
        }
        match raw::take_exception(ctx) {
            Some(value) => unsafe { qjs::JS_Throw(ctx, value) },
            None => raw::throw(
                ctx,
                ErrorKind::Internal,
                "exception signalled without a pending exception",
            ),
        }
    }
}

impl fmt::Debug for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exception")
            .field("location", &format_args!("{}", self.location))
            .finish()
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "runtime exception raised at {}", self.location)
    }
}

impl std::error::Error for Exception {}

// =============================================================================
// Engine results
// =============================================================================

/// Attach the pending exception of an engine call to its native call site.
#[track_caller]
pub(crate) fn check(ctx: &Context, value: qjs::JSValue) -> Result<qjs::JSValue> {
    if raw::is_exception(value) {
        Err(Error::Exception(Exception::new(ctx)))
    } else {
        Ok(value)
    }
}

/// Like [`check`], for engine calls reporting failure as a negative status.
#[track_caller]
pub(crate) fn check_status(ctx: &Context, status: c_int) -> Result<c_int> {
    if status < 0 {
        Err(Error::Exception(Exception::new(ctx)))
    } else {
        Ok(status)
    }
}

// =============================================================================
// Callback boundaries
// =============================================================================

/// Run native code at a callback boundary.
///
/// Errors and panics are converted into the pending exception of `ctx` and
/// reported to the engine as the exception sentinel.
pub(crate) fn guard(ctx: *mut qjs::JSContext, f: impl FnOnce() -> Result<qjs::JSValue>) -> qjs::JSValue {
    boundary(ctx, f).unwrap_or(qjs::JS_EXCEPTION)
}

/// Like [`guard`], for engine hooks with their own failure convention.
/// `None` means an exception is now pending.
pub(crate) fn boundary<T>(ctx: *mut qjs::JSContext, f: impl FnOnce() -> Result<T>) -> Option<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Some(value),
        Ok(Err(err)) => {
            err.throw_raw(ctx);
            None
        }
        Err(payload) => {
            let message = panic_message(&*payload);
            warn!(%message, "native callback panicked");
            raw::throw(ctx, ErrorKind::Internal, &message);
            None
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown error".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Runtime;

    fn pending_message(ctx: &Context) -> String {
        ctx.get_exception().to_string()
    }

    #[test]
    fn display_uses_message_verbatim() {
        let err = Error::type_mismatch("expected at least 2 arguments but received 1");
        assert_eq!(err.to_string(), "expected at least 2 arguments but received 1");
    }

    #[test]
    fn throw_maps_taxonomy_to_error_kinds() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);

        let cases = [
            (Error::type_mismatch("a"), "TypeError: a"),
            (Error::range("b"), "RangeError: b"),
            (Error::RuntimeOperationFailed("c".into()), "InternalError: c"),
            (Error::InternalInvariant("d".into()), "InternalError: d"),
        ];
        for (err, expected) in cases {
            assert!(raw::is_exception(err.throw(&ctx)));
            assert_eq!(pending_message(&ctx), expected);
        }
    }

    #[test]
    fn exception_keeps_pending_value() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        raw::throw(ctx.raw(), ErrorKind::Range, "boom");
        let err = check(&ctx, qjs::JS_EXCEPTION).err().unwrap();
        err.throw(&ctx);
        assert_eq!(pending_message(&ctx), "RangeError: boom");
        assert!(ctx.get_exception().is_null());
    }

    #[test]
    fn exception_records_call_site() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        raw::throw(ctx.raw(), ErrorKind::Type, "x");
        let line = line!() + 1;
        let err = check(&ctx, qjs::JS_EXCEPTION).err().unwrap();
        let Error::Exception(exception) = err else {
            panic!("expected exception");
        };
        assert_eq!(exception.location().line(), line);
        assert!(exception.location().file().ends_with("error.rs"));
        assert_eq!(exception.message().unwrap(), "TypeError: x");
    }

    #[test]
    fn exception_moves_between_contexts_of_one_runtime() {
        let rt = Runtime::new();
        let first = Context::new(&rt);
        let second = Context::new(&rt);
        raw::throw(first.raw(), ErrorKind::Type, "shared");
        let err = check(&first, qjs::JS_EXCEPTION).err().unwrap();
        err.throw(&second);
        assert_eq!(pending_message(&second), "TypeError: shared");
    }

    #[test]
    fn exception_from_another_runtime_becomes_internal() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        let other_rt = Runtime::new();
        let other = Context::new(&other_rt);
        raw::throw(other.raw(), ErrorKind::Type, "elsewhere");
        let err = check(&other, qjs::JS_EXCEPTION).err().unwrap();
        err.throw(&ctx);
        assert_eq!(pending_message(&ctx), "InternalError: exception raised in another runtime");
        raw::clear_exception(other.raw());
    }

    #[test]
    fn guard_converts_panics() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        let result = guard(ctx.raw(), || panic!("exploded"));
        assert!(raw::is_exception(result));
        assert_eq!(pending_message(&ctx), "InternalError: exploded");
    }

    #[test]
    fn guard_passes_values_through() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        let result = guard(ctx.raw(), || Ok(qjs::JS_TRUE));
        assert!(raw::same_identity(result, qjs::JS_TRUE));
        assert!(ctx.get_exception().is_null());
    }
}
