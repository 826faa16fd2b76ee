//! Conversion between native types and runtime values.
//!
//! [`FromScript`] reads a native value out of a borrowed runtime value,
//! [`ToScript`] produces a new runtime reference from a native value. Both
//! are open: any crate can implement them for its own types.

mod callable;
mod containers;
mod enums;

pub use callable::{Func, IntoArgs};
pub use containers::{Entries, Rest};

use rquickjs::qjs;

use crate::context::Context;
use crate::error::{Error, Exception, Result, check, check_status};
use crate::raw;
use crate::value::Value;

/// Convert from a runtime value to a Rust type (for arguments and results).
///
/// # Example
///
/// ```
/// use scriptbind::{Context, FromScript, Result, Runtime};
/// use scriptbind::qjs;
///
/// struct Celsius(f64);
///
/// impl FromScript for Celsius {
///     fn from_script(ctx: &Context, value: qjs::JSValue) -> Result<Self> {
///         f64::from_script(ctx, value).map(Celsius)
///     }
/// }
///
/// let rt = Runtime::new();
/// let ctx = Context::new(&rt);
/// let value = ctx.new_value(21.5).unwrap();
/// assert_eq!(value.to::<Celsius>().unwrap().0, 21.5);
/// ```
pub trait FromScript: Sized {
    /// Convert a borrowed runtime value.
    fn from_script(ctx: &Context, value: qjs::JSValue) -> Result<Self>;

    #[doc(hidden)]
    const IS_REST: bool = false;

    /// Read the parameter at `index` from a call's arguments.
    #[doc(hidden)]
    fn from_args(ctx: &Context, args: &[qjs::JSValue], index: usize, expected: usize) -> Result<Self> {
        match args.get(index) {
            Some(&value) => Self::from_script(ctx, value),
            None => Err(Error::type_mismatch(format!(
                "expected at least {expected} arguments but received {}",
                args.len()
            ))),
        }
    }
}

/// Convert from a Rust type to a new runtime value (for results and
/// arguments).
///
/// # Example
///
/// ```
/// use scriptbind::{Context, Result, Runtime, ToScript};
/// use scriptbind::qjs;
///
/// struct Meters(f64);
///
/// impl ToScript for Meters {
///     fn to_script(self, ctx: &Context) -> Result<qjs::JSValue> {
///         self.0.to_script(ctx)
///     }
/// }
///
/// let rt = Runtime::new();
/// let ctx = Context::new(&rt);
/// assert_eq!(ctx.new_value(Meters(3.0)).unwrap().to::<f64>().unwrap(), 3.0);
/// ```
pub trait ToScript {
    /// Produce an owned runtime value.
    fn to_script(self, ctx: &Context) -> Result<qjs::JSValue>;
}

/// Convert an owned runtime value, releasing it on every path.
pub(crate) fn take<T: FromScript>(ctx: &Context, value: qjs::JSValue) -> Result<T> {
    let result = T::from_script(ctx, value);
    unsafe { qjs::JS_FreeValue(ctx.raw(), value) };
    result
}

// =============================================================================
// Unit, booleans, strings
// =============================================================================

impl FromScript for () {
    fn from_script(_ctx: &Context, _value: qjs::JSValue) -> Result<Self> {
        Ok(())
    }
}

impl ToScript for () {
    fn to_script(self, _ctx: &Context) -> Result<qjs::JSValue> {
        Ok(qjs::JS_NULL)
    }
}

impl FromScript for bool {
    fn from_script(ctx: &Context, value: qjs::JSValue) -> Result<Self> {
        let truth = check_status(ctx, unsafe { qjs::JS_ToBool(ctx.raw(), value) })?;
        Ok(truth != 0)
    }
}

impl ToScript for bool {
    fn to_script(self, _ctx: &Context) -> Result<qjs::JSValue> {
        Ok(raw::new_bool(self))
    }
}

impl FromScript for String {
    fn from_script(ctx: &Context, value: qjs::JSValue) -> Result<Self> {
        match raw::to_string(ctx.raw(), value) {
            Some(text) => Ok(text),
            None => Err(Exception::new(ctx).into()),
        }
    }
}

impl ToScript for String {
    fn to_script(self, ctx: &Context) -> Result<qjs::JSValue> {
        self.as_str().to_script(ctx)
    }
}

impl ToScript for &str {
    fn to_script(self, ctx: &Context) -> Result<qjs::JSValue> {
        check(ctx, unsafe { qjs::JS_NewStringLen(ctx.raw(), self.as_ptr().cast(), self.len() as _) })
    }
}

impl ToScript for &String {
    fn to_script(self, ctx: &Context) -> Result<qjs::JSValue> {
        self.as_str().to_script(ctx)
    }
}

// =============================================================================
// Numbers
// =============================================================================

// Integers widen through i64 and are range-checked before narrowing.
macro_rules! integer {
    ($($ty:ty),*) => {$(
        impl FromScript for $ty {
            fn from_script(ctx: &Context, value: qjs::JSValue) -> Result<Self> {
                let mut wide = 0i64;
                check_status(ctx, unsafe { qjs::JS_ToInt64(ctx.raw(), &mut wide, value) })?;
                <$ty>::try_from(wide).map_err(|_| {
                    Error::range(concat!("Could not unwrap integer into ", stringify!($ty)))
                })
            }
        }

        impl ToScript for $ty {
            fn to_script(self, _ctx: &Context) -> Result<qjs::JSValue> {
                let wide = i64::try_from(self).map_err(|_| Error::range("Could not wrap integer into i64"))?;
                Ok(qjs::JS_NewFloat64(wide as f64))
            }
        }
    )*};
}

integer!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

impl FromScript for f64 {
    fn from_script(ctx: &Context, value: qjs::JSValue) -> Result<Self> {
        let mut number = 0f64;
        check_status(ctx, unsafe { qjs::JS_ToFloat64(ctx.raw(), &mut number, value) })?;
        Ok(number)
    }
}

impl ToScript for f64 {
    fn to_script(self, _ctx: &Context) -> Result<qjs::JSValue> {
        Ok(qjs::JS_NewFloat64(self))
    }
}

impl FromScript for f32 {
    fn from_script(ctx: &Context, value: qjs::JSValue) -> Result<Self> {
        f64::from_script(ctx, value).map(|n| n as f32)
    }
}

impl ToScript for f32 {
    fn to_script(self, ctx: &Context) -> Result<qjs::JSValue> {
        f64::from(self).to_script(ctx)
    }
}

// =============================================================================
// Values, options, results
// =============================================================================

impl FromScript for Value {
    fn from_script(ctx: &Context, value: qjs::JSValue) -> Result<Self> {
        Ok(Value::borrowed(ctx, value))
    }
}

impl ToScript for Value {
    fn to_script(self, ctx: &Context) -> Result<qjs::JSValue> {
        if self.belongs_to(ctx.runtime().raw()) || !raw::has_ref_count(self.raw()) {
            return Ok(self.release());
        }
        if self.context().is_some() {
            return Err(Error::RuntimeOperationFailed("value belongs to another runtime".into()));
        }
        Err(Error::InternalInvariant("value is not bound to a live context".into()))
    }
}

impl ToScript for &Value {
    fn to_script(self, ctx: &Context) -> Result<qjs::JSValue> {
        self.clone().to_script(ctx)
    }
}

impl ToScript for qjs::JSValue {
    /// Passes an already owned reference through.
    fn to_script(self, _ctx: &Context) -> Result<qjs::JSValue> {
        Ok(self)
    }
}

/// `null` and conversion failures read as `None`. A failed conversion
/// clears the exception it raised.
impl<T: FromScript> FromScript for Option<T> {
    fn from_script(ctx: &Context, value: qjs::JSValue) -> Result<Self> {
        if raw::is_null(value) {
            return Ok(None);
        }
        match T::from_script(ctx, value) {
            Ok(value) => Ok(Some(value)),
            Err(_) => {
                raw::clear_exception(ctx.raw());
                Ok(None)
            }
        }
    }

    fn from_args(ctx: &Context, args: &[qjs::JSValue], index: usize, _expected: usize) -> Result<Self> {
        match args.get(index) {
            Some(&value) => Self::from_script(ctx, value),
            None => Ok(None),
        }
    }
}

impl<T: ToScript> ToScript for Option<T> {
    fn to_script(self, ctx: &Context) -> Result<qjs::JSValue> {
        match self {
            Some(value) => value.to_script(ctx),
            None => Ok(qjs::JS_NULL),
        }
    }
}

/// Native failures returned from bound functions become runtime exceptions.
impl<T: ToScript, E: Into<Error>> ToScript for std::result::Result<T, E> {
    fn to_script(self, ctx: &Context) -> Result<qjs::JSValue> {
        match self {
            Ok(value) => value.to_script(ctx),
            Err(err) => Err(err.into()),
        }
    }
}
