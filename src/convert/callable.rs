//! Runtime functions as typed native callables.

use std::fmt;
use std::marker::PhantomData;

use rquickjs::qjs;

use super::{FromScript, ToScript};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::raw;
use crate::value::Value;

/// Arguments for a call into the runtime.
pub trait IntoArgs {
    fn into_args(self, ctx: &Context) -> Result<Vec<Value>>;
}

impl IntoArgs for Vec<Value> {
    fn into_args(self, _ctx: &Context) -> Result<Vec<Value>> {
        Ok(self)
    }
}

impl IntoArgs for &[Value] {
    fn into_args(self, _ctx: &Context) -> Result<Vec<Value>> {
        Ok(self.to_vec())
    }
}

macro_rules! tuple_args {
    ($($arg:ident $var:ident),*) => {
        impl<$($arg: ToScript),*> IntoArgs for ($($arg,)*) {
            #[allow(unused_variables)]
            fn into_args(self, ctx: &Context) -> Result<Vec<Value>> {
                let ($($var,)*) = self;
                Ok(vec![$(ctx.new_value($var)?),*])
            }
        }
    };
}

tuple_args!();
tuple_args!(A0 a0);
tuple_args!(A0 a0, A1 a1);
tuple_args!(A0 a0, A1 a1, A2 a2);
tuple_args!(A0 a0, A1 a1, A2 a2, A3 a3);
tuple_args!(A0 a0, A1 a1, A2 a2, A3 a3, A4 a4);
tuple_args!(A0 a0, A1 a1, A2 a2, A3 a3, A4 a4, A5 a5);
tuple_args!(A0 a0, A1 a1, A2 a2, A3 a3, A4 a4, A5 a5, A6 a6);
tuple_args!(A0 a0, A1 a1, A2 a2, A3 a3, A4 a4, A5 a5, A6 a6, A7 a7);

/// A runtime function called with native arguments and a native result.
///
/// `Args` is a tuple of [`ToScript`] types and `R` a [`FromScript`] type.
///
/// ```
/// use scriptbind::{Context, EvalFlags, Func, Runtime};
///
/// let rt = Runtime::new();
/// let ctx = Context::new(&rt);
/// let add: Func<(i32, i32), i32> = ctx
///     .eval("(a, b) => a + b", "<doc>", EvalFlags::TYPE_GLOBAL)
///     .unwrap()
///     .to()
///     .unwrap();
/// assert_eq!(add.call((2, 3)).unwrap(), 5);
/// ```
pub struct Func<Args, R> {
    function: Value,
    _signature: PhantomData<fn(Args) -> R>,
}

impl<Args: IntoArgs, R: FromScript> Func<Args, R> {
    pub fn call(&self, args: Args) -> Result<R> {
        self.function.call(args)?.to()
    }

    /// The underlying function value.
    pub fn value(&self) -> &Value {
        &self.function
    }
}

impl<Args, R> Clone for Func<Args, R> {
    fn clone(&self) -> Self {
        Self {
            function: self.function.clone(),
            _signature: PhantomData,
        }
    }
}

impl<Args, R> fmt::Debug for Func<Args, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Func").field(&self.function).finish()
    }
}

impl<Args, R> FromScript for Func<Args, R> {
    fn from_script(ctx: &Context, value: qjs::JSValue) -> Result<Self> {
        let kind = raw::type_of(ctx.raw(), value);
        if kind != "function" {
            return Err(Error::type_mismatch(format!("expected a function, got {kind}")));
        }
        Ok(Self {
            function: Value::borrowed(ctx, value),
            _signature: PhantomData,
        })
    }
}

impl<Args, R> ToScript for Func<Args, R> {
    fn to_script(self, ctx: &Context) -> Result<qjs::JSValue> {
        self.function.to_script(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EvalFlags, Runtime};

    #[test]
    fn calls_back_into_the_runtime() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        let join: Func<(String, Vec<i32>), String> = ctx
            .eval("(sep, xs) => xs.join(sep)", "<test>", EvalFlags::TYPE_GLOBAL)
            .unwrap()
            .to()
            .unwrap();
        assert_eq!(join.call(("-".to_owned(), vec![1, 2, 3])).unwrap(), "1-2-3");
    }

    #[test]
    fn rejects_non_functions() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        let err = ctx.new_value(1).unwrap().to::<Func<(), ()>>().unwrap_err();
        assert_eq!(err.to_string(), "expected a function, got number");
    }

    #[test]
    fn runtime_exceptions_surface_as_errors() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        let fail: Func<(), ()> = ctx
            .eval("() => { throw new RangeError('nope') }", "<test>", EvalFlags::TYPE_GLOBAL)
            .unwrap()
            .to()
            .unwrap();
        let Err(Error::Exception(exception)) = fail.call(()) else {
            panic!("expected a runtime exception");
        };
        assert_eq!(exception.message().unwrap(), "RangeError: nope");
    }
}
