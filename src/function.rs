//! Wrapping native callables as runtime functions.
//!
//! Any `Fn(A0, .., An) -> R` whose parameters implement [`FromScript`] and
//! whose result implements [`ToScript`] can be exposed to scripts. Arguments
//! are converted positionally. A trailing [`Rest`](crate::Rest) parameter
//! collects whatever arguments remain.

use std::ffi::c_int;
use std::fmt;
use std::rc::Rc;

use rquickjs::qjs;
use scriptbind_registry::BoundPtr;
use tracing::trace;

use crate::class::Payload;
use crate::context::Context;
use crate::convert::{FromScript, ToScript};
use crate::error::{Error, Result, check, check_status, guard};
use crate::raw;
use crate::value::Value;

/// A native callable with a fixed parameter list.
///
/// Implemented for closures and functions of up to eight parameters; `Args`
/// is the tuple of parameter types.
pub trait IntoNativeFn<Args, Ret>: 'static {
    /// Number of declared parameters.
    const PARAMS: usize;

    /// Parameters that must be supplied; a trailing rest parameter is not
    /// counted.
    const REQUIRED: usize;

    /// Convert the arguments and call.
    ///
    /// With `pass_this` the receiver is converted as the first parameter
    /// and the arguments fill the rest.
    fn invoke(&self, ctx: &Context, this: qjs::JSValue, args: &[qjs::JSValue], pass_this: bool) -> Result<Ret>;
}

/// Whether a rest parameter, if any, comes last.
#[doc(hidden)]
pub const fn rest_is_last(flags: &[bool]) -> bool {
    let mut i = 0;
    while i + 1 < flags.len() {
        if flags[i] {
            return false;
        }
        i += 1;
    }
    true
}

const fn rest_count(flags: &[bool]) -> usize {
    match flags.last() {
        Some(true) => 1,
        _ => 0,
    }
}

/// Hands out call arguments to parameters in declaration order.
struct Params<'a> {
    this: Option<qjs::JSValue>,
    args: &'a [qjs::JSValue],
    next: usize,
    expected: usize,
}

impl<'a> Params<'a> {
    fn new(this: qjs::JSValue, args: &'a [qjs::JSValue], pass_this: bool, required: usize) -> Self {
        Self {
            this: pass_this.then_some(this),
            args,
            next: 0,
            expected: required.saturating_sub(usize::from(pass_this)),
        }
    }

    fn next<T: FromScript>(&mut self, ctx: &Context) -> Result<T> {
        if let Some(this) = self.this.take() {
            return T::from_script(ctx, this);
        }
        let index = self.next;
        self.next += 1;
        T::from_args(ctx, self.args, index, self.expected)
    }
}

macro_rules! impl_native_fn {
    ($count:literal $(, $arg:ident $var:ident)*) => {
        impl<Func, Ret, $($arg,)*> IntoNativeFn<($($arg,)*), Ret> for Func
        where
            Func: Fn($($arg),*) -> Ret + 'static,
            $($arg: FromScript,)*
        {
            const PARAMS: usize = $count;
            const REQUIRED: usize = $count - rest_count(&[$(<$arg as FromScript>::IS_REST),*]);

            #[allow(unused_mut, unused_variables)]
            fn invoke(&self, ctx: &Context, this: qjs::JSValue, args: &[qjs::JSValue], pass_this: bool) -> Result<Ret> {
                const {
                    assert!(
                        rest_is_last(&[$(<$arg as FromScript>::IS_REST),*]),
                        "`Rest` must be the last parameter"
                    )
                };
                let mut params = Params::new(this, args, pass_this, Self::REQUIRED);
                $(let $var = params.next::<$arg>(ctx)?;)*
                Ok((self)($($var),*))
            }
        }
    };
}

impl_native_fn!(0);
impl_native_fn!(1, A0 a0);
impl_native_fn!(2, A0 a0, A1 a1);
impl_native_fn!(3, A0 a0, A1 a1, A2 a2);
impl_native_fn!(4, A0 a0, A1 a1, A2 a2, A3 a3);
impl_native_fn!(5, A0 a0, A1 a1, A2 a2, A3 a3, A4 a4);
impl_native_fn!(6, A0 a0, A1 a1, A2 a2, A3 a3, A4 a4, A5 a5);
impl_native_fn!(7, A0 a0, A1 a1, A2 a2, A3 a3, A4 a4, A5 a5, A6 a6);
impl_native_fn!(8, A0 a0, A1 a1, A2 a2, A3 a3, A4 a4, A5 a5, A6 a6, A7 a7);

type Invoke = Box<dyn Fn(&Context, qjs::JSValue, &[qjs::JSValue]) -> Result<qjs::JSValue>>;

/// A native callable ready to be installed as a runtime function.
///
/// Converting it with [`ToScript`] creates the function object; the
/// callable is dropped when the runtime collects that object.
pub struct Function {
    name: String,
    length: u32,
    constructor: bool,
    invoke: Invoke,
}

impl Function {
    /// Wrap a callable that ignores the receiver.
    pub fn new<F, Args, R>(name: impl Into<String>, f: F) -> Self
    where
        F: IntoNativeFn<Args, R>,
        Args: 'static,
        R: ToScript + 'static,
    {
        Self::wrap(name.into(), f, false)
    }

    /// Wrap a callable whose first parameter receives `this`.
    pub fn with_this<F, Args, R>(name: impl Into<String>, f: F) -> Self
    where
        F: IntoNativeFn<Args, R>,
        Args: 'static,
        R: ToScript + 'static,
    {
        Self::wrap(name.into(), f, true)
    }

    fn wrap<F, Args, R>(name: String, f: F, pass_this: bool) -> Self
    where
        F: IntoNativeFn<Args, R>,
        Args: 'static,
        R: ToScript + 'static,
    {
        let length = F::REQUIRED.saturating_sub(usize::from(pass_this));
        Self::from_raw_parts(name, u32::try_from(length).unwrap_or(u32::MAX), move |ctx, this, args| {
            f.invoke(ctx, this, args, pass_this)?.to_script(ctx)
        })
    }

    pub(crate) fn from_raw_parts(
        name: String,
        length: u32,
        invoke: impl Fn(&Context, qjs::JSValue, &[qjs::JSValue]) -> Result<qjs::JSValue> + 'static,
    ) -> Self {
        Self {
            name,
            length,
            constructor: false,
            invoke: Box::new(invoke),
        }
    }

    /// Mark as callable with `new` only. The receiver is then `new.target`.
    pub(crate) fn into_constructor(mut self) -> Self {
        self.constructor = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value of the function's `length` property.
    pub fn length(&self) -> u32 {
        self.length
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("length", &self.length)
            .field("constructor", &self.constructor)
            .finish_non_exhaustive()
    }
}

/// Payload of the object each runtime function keeps as its data slot.
pub(crate) struct Descriptor {
    name: String,
    constructor: bool,
    invoke: Invoke,
}

impl ToScript for Function {
    fn to_script(self, ctx: &Context) -> Result<qjs::JSValue> {
        let Function {
            name,
            length,
            constructor,
            invoke,
        } = self;
        let descriptor = Rc::new(Descriptor {
            name: name.clone(),
            constructor,
            invoke,
        });
        let holder = Value::owned(ctx, ctx.new_instance(BoundPtr::Shared(descriptor), None)?);
        let mut data = [holder.raw()];
        let length = c_int::try_from(length).unwrap_or(c_int::MAX);
        let function = check(ctx, unsafe {
            qjs::JS_NewCFunctionData(ctx.raw(), Some(trampoline), length, 0, 1, data.as_mut_ptr())
        })?;
        let function = Value::owned(ctx, function);
        let name = ctx.new_value(name.as_str())?;
        check_status(ctx, unsafe {
            qjs::JS_DefinePropertyValueStr(
                ctx.raw(),
                function.raw(),
                c"name".as_ptr(),
                name.release(),
                qjs::JS_PROP_CONFIGURABLE as c_int,
            )
        })?;
        if constructor {
            unsafe { qjs::JS_SetConstructorBit(ctx.raw(), function.raw(), true.into()) };
        }
        Ok(function.release())
    }
}

fn descriptor(ctx: &Context, data: qjs::JSValue) -> Result<Rc<Descriptor>> {
    let class = ctx.runtime().function_class();
    let payload = unsafe { qjs::JS_GetOpaque(data, class.raw()) } as *const Payload;
    unsafe { payload.as_ref() }
        .and_then(|payload| payload.downcast_ref::<BoundPtr<Descriptor>>())
        .and_then(BoundPtr::get)
        .ok_or_else(|| Error::InternalInvariant("native function is missing its descriptor".into()))
}

#[cfg_attr(feature = "profiling", profiling::function)]
unsafe extern "C" fn trampoline(
    ctx: *mut qjs::JSContext,
    this: qjs::JSValue,
    argc: c_int,
    argv: *mut qjs::JSValue,
    _magic: c_int,
    data: *mut qjs::JSValue,
) -> qjs::JSValue {
    let args = unsafe { raw::args(argc, argv) };
    guard(ctx, || {
        let context = Context::resolve(ctx)?;
        let descriptor = descriptor(&context, unsafe { *data })?;
        trace!(function = %descriptor.name, argc = args.len(), "native call");
        // Under `new` the receiver slot carries new.target.
        if descriptor.constructor && !raw::truthy(unsafe { qjs::JS_IsConstructor(ctx, this) }) {
            return Err(Error::type_mismatch(format!(
                "class constructor {} cannot be invoked without 'new'",
                descriptor.name
            )));
        }
        (descriptor.invoke)(&context, this, args)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, EvalFlags, Rest, Runtime, Value};

    fn eval(ctx: &Context, source: &str) -> Result<Value> {
        ctx.eval(source, "<test>", EvalFlags::TYPE_GLOBAL)
    }

    fn exception_text(result: Result<Value>) -> String {
        match result {
            Err(Error::Exception(exception)) => exception.message().unwrap_or_default(),
            other => panic!("expected a runtime exception, got {other:?}"),
        }
    }

    #[test]
    fn rest_position_check() {
        assert!(rest_is_last(&[]));
        assert!(rest_is_last(&[false, true]));
        assert!(!rest_is_last(&[true, false]));
        assert_eq!(rest_count(&[false, true]), 1);
        assert_eq!(rest_count(&[false]), 0);
    }

    #[test]
    fn missing_arguments_name_the_arity() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        ctx.global().set_function("add", |a: i32, b: i32| a + b).unwrap();
        assert_eq!(eval(&ctx, "add(1, 2)").unwrap().to::<i32>().unwrap(), 3);
        assert_eq!(
            exception_text(eval(&ctx, "add(1)")),
            "TypeError: expected at least 2 arguments but received 1"
        );
    }

    #[test]
    fn rest_collects_trailing_arguments_in_order() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        ctx.global()
            .set_function("tag", |head: String, rest: Rest<String>| {
                format!("{head}:{}:{}", rest.0.len(), rest.0.join(","))
            })
            .unwrap();
        for (call, expected) in [
            ("tag('x')", "x:0:"),
            ("tag('x', 'a')", "x:1:a"),
            ("tag('x', 'a', 'b', 'c')", "x:3:a,b,c"),
        ] {
            assert_eq!(eval(&ctx, call).unwrap().to::<String>().unwrap(), expected);
        }
        assert_eq!(
            exception_text(eval(&ctx, "tag()")),
            "TypeError: expected at least 1 arguments but received 0"
        );
    }

    #[test]
    fn length_counts_required_parameters() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        let f = Function::new("f", |_: i32, _: Rest<i32>| ());
        assert_eq!(f.length(), 1);
        let g = Function::with_this("g", |_: Value, _: i32, _: i32| ());
        assert_eq!(g.length(), 2);
        let value = ctx.new_value(g).unwrap();
        assert_eq!(value.get_as::<u32, _>("length").unwrap(), 2);
        assert_eq!(value.get_as::<String, _>("name").unwrap(), "g");
    }

    #[test]
    fn receiver_is_the_first_parameter() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        let object = ctx.new_object().unwrap();
        object.set("base", 10).unwrap();
        object
            .set(
                "plus",
                Function::with_this("plus", |this: Value, n: i32| -> Result<i32> {
                    Ok(this.get_as::<i32, _>("base")? + n)
                }),
            )
            .unwrap();
        ctx.global().set("o", &object).unwrap();
        assert_eq!(eval(&ctx, "o.plus(5)").unwrap().to::<i32>().unwrap(), 15);
    }

    #[test]
    fn native_failures_become_exceptions() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        let global = ctx.global();
        global.set_function("narrow", |n: u8| n).unwrap();
        global
            .set_function("fail", || -> Result<()> { Err(Error::type_mismatch("bad input")) })
            .unwrap();
        global.set_function("explode", || -> i32 { panic!("kaboom") }).unwrap();

        assert_eq!(
            exception_text(eval(&ctx, "narrow(1000)")),
            "RangeError: Could not unwrap integer into u8"
        );
        assert_eq!(exception_text(eval(&ctx, "fail()")), "TypeError: bad input");
        assert_eq!(exception_text(eval(&ctx, "explode()")), "InternalError: kaboom");
    }

    #[test]
    fn void_returns_null() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        ctx.global().set_function("noop", || ()).unwrap();
        assert!(eval(&ctx, "noop()").unwrap().is_null());
    }

    #[test]
    fn descriptor_is_dropped_with_the_function() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        let token = Rc::new(());
        let held = token.clone();
        let value = ctx.new_value(Function::new("hold", move || Rc::strong_count(&held) as i32)).unwrap();
        assert_eq!(Rc::strong_count(&token), 2);
        drop(value);
        assert_eq!(Rc::strong_count(&token), 1);
    }
}
