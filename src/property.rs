//! Property access by key type.
//!
//! Every key becomes an engine atom for the duration of one access. Text
//! keys are interned as written. Integers in the unsigned 32-bit range
//! become index atoms; any other integer is keyed by its decimal text, so
//! a negative index stays negative and a wide unsigned index keeps every
//! digit.

use std::ffi::c_int;
use std::marker::PhantomData;

use rquickjs::qjs;

use crate::context::Context;
use crate::error::{Error, Exception, Result, check, check_status};
use crate::raw;

/// An interned property key, released when dropped.
pub struct Atom<'ctx> {
    ctx: *mut qjs::JSContext,
    raw: qjs::JSAtom,
    _ctx: PhantomData<&'ctx Context>,
}

impl<'ctx> Atom<'ctx> {
    fn new(ctx: &'ctx Context, raw: qjs::JSAtom) -> Result<Self> {
        if raw == qjs::JS_ATOM_NULL {
            return Err(Exception::new(ctx).into());
        }
        Ok(Self {
            ctx: ctx.raw(),
            raw,
            _ctx: PhantomData,
        })
    }

    pub fn from_name(ctx: &'ctx Context, name: &str) -> Result<Self> {
        let raw = unsafe { qjs::JS_NewAtomLen(ctx.raw(), name.as_ptr().cast(), name.len() as _) };
        Self::new(ctx, raw)
    }

    pub fn from_u32(ctx: &'ctx Context, index: u32) -> Result<Self> {
        Self::new(ctx, unsafe { qjs::JS_NewAtomUInt32(ctx.raw(), index) })
    }

    pub fn raw(&self) -> qjs::JSAtom {
        self.raw
    }

    /// The key as text, for diagnostics.
    pub fn name(&self) -> String {
        let text = unsafe { qjs::JS_AtomToCString(self.ctx, self.raw) };
        if text.is_null() {
            raw::clear_exception(self.ctx);
            return String::new();
        }
        let name = unsafe { raw::from_cstr(text) };
        unsafe { qjs::JS_FreeCString(self.ctx, text) };
        name
    }
}

impl Drop for Atom<'_> {
    fn drop(&mut self) {
        unsafe { qjs::JS_FreeAtom(self.ctx, self.raw) };
    }
}

/// A type usable as a property key.
pub trait PropertyKey {
    /// The engine key this value addresses.
    fn atom<'ctx>(&self, ctx: &'ctx Context) -> Result<Atom<'ctx>>;
}

impl<K: PropertyKey + ?Sized> PropertyKey for &K {
    fn atom<'ctx>(&self, ctx: &'ctx Context) -> Result<Atom<'ctx>> {
        (**self).atom(ctx)
    }
}

impl PropertyKey for str {
    fn atom<'ctx>(&self, ctx: &'ctx Context) -> Result<Atom<'ctx>> {
        Atom::from_name(ctx, self)
    }
}

impl PropertyKey for String {
    fn atom<'ctx>(&self, ctx: &'ctx Context) -> Result<Atom<'ctx>> {
        Atom::from_name(ctx, self)
    }
}

macro_rules! integer_key {
    ($($ty:ty),*) => {$(
        impl PropertyKey for $ty {
            fn atom<'ctx>(&self, ctx: &'ctx Context) -> Result<Atom<'ctx>> {
                match u32::try_from(*self) {
                    Ok(index) => Atom::from_u32(ctx, index),
                    Err(_) => Atom::from_name(ctx, &self.to_string()),
                }
            }
        }
    )*};
}

integer_key!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

/// Read a property. Returns a new reference.
#[track_caller]
pub(crate) fn get<K: PropertyKey + ?Sized>(ctx: &Context, object: qjs::JSValue, key: &K) -> Result<qjs::JSValue> {
    let atom = key.atom(ctx)?;
    check(ctx, unsafe { qjs::JS_GetProperty(ctx.raw(), object, atom.raw()) })
}

/// Assign a property, reporting engine failures as
/// [`Error::RuntimeOperationFailed`]. Takes ownership of `value`.
pub(crate) fn set<K: PropertyKey + ?Sized>(ctx: &Context, object: qjs::JSValue, key: &K, value: qjs::JSValue) -> Result<()> {
    let atom = match key.atom(ctx) {
        Ok(atom) => atom,
        Err(err) => {
            unsafe { qjs::JS_FreeValue(ctx.raw(), value) };
            return Err(err);
        }
    };
    let status = unsafe { qjs::JS_SetProperty(ctx.raw(), object, atom.raw(), value) };
    if status < 0 {
        let message = take_message(ctx.raw());
        return Err(Error::RuntimeOperationFailed(format!(
            "could not set property '{}': {message}",
            atom.name()
        )));
    }
    Ok(())
}

/// Take the pending exception and describe it.
pub(crate) fn take_message(ctx: *mut qjs::JSContext) -> String {
    let Some(exception) = raw::take_exception(ctx) else {
        return "unknown error".to_owned();
    };
    let message = raw::to_string(ctx, exception).unwrap_or_else(|| {
        raw::clear_exception(ctx);
        "unknown error".to_owned()
    });
    unsafe { qjs::JS_FreeValue(ctx, exception) };
    message
}

// =============================================================================
// Own property tables
// =============================================================================

/// Own enumerable string-keyed properties of an object, in engine order.
pub(crate) struct OwnKeys<'ctx> {
    ctx: &'ctx Context,
    table: *mut qjs::JSPropertyEnum,
    len: u32,
}

impl<'ctx> OwnKeys<'ctx> {
    pub(crate) fn of(ctx: &'ctx Context, object: qjs::JSValue) -> Result<Self> {
        let mut table = std::ptr::null_mut();
        let mut len = 0;
        let flags = (qjs::JS_GPN_STRING_MASK | qjs::JS_GPN_ENUM_ONLY) as c_int;
        check_status(ctx, unsafe {
            qjs::JS_GetOwnPropertyNames(ctx.raw(), &mut table, &mut len, object, flags)
        })?;
        Ok(Self { ctx, table, len })
    }

    pub(crate) fn atoms(&self) -> impl Iterator<Item = qjs::JSAtom> + '_ {
        (0..self.len as usize).map(|i| unsafe { (*self.table.add(i)).atom })
    }

    /// The key as a runtime value; index keys read as strings.
    pub(crate) fn key(&self, atom: qjs::JSAtom) -> Result<qjs::JSValue> {
        check(self.ctx, unsafe { qjs::JS_AtomToString(self.ctx.raw(), atom) })
    }

    pub(crate) fn value(&self, object: qjs::JSValue, atom: qjs::JSAtom) -> Result<qjs::JSValue> {
        check(self.ctx, unsafe { qjs::JS_GetProperty(self.ctx.raw(), object, atom) })
    }
}

impl Drop for OwnKeys<'_> {
    fn drop(&mut self) {
        let ctx = self.ctx.raw();
        for atom in self.atoms() {
            unsafe { qjs::JS_FreeAtom(ctx, atom) };
        }
        unsafe { qjs::js_free(ctx, self.table.cast()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Runtime, Value};

    fn read(ctx: &Context, object: &Value, key: impl PropertyKey) -> Value {
        let raw = get(ctx, object.raw(), &key).unwrap();
        Value::owned(ctx, raw)
    }

    fn write(ctx: &Context, object: &Value, key: impl PropertyKey, value: i32) {
        let value = ctx.new_value(value).unwrap();
        set(ctx, object.raw(), &key, value.release()).unwrap();
    }

    #[test]
    fn negative_keys_stay_negative() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        let object = ctx.new_object().unwrap();
        write(&ctx, &object, -1i32, 5);
        assert_eq!(read(&ctx, &object, "-1").to::<i32>().unwrap(), 5);
        assert_eq!((-1i64).atom(&ctx).unwrap().name(), "-1");
    }

    #[test]
    fn unsigned_and_text_keys_agree() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        let object = ctx.new_object().unwrap();
        write(&ctx, &object, 3u8, 1);
        assert_eq!(read(&ctx, &object, "3").to::<i32>().unwrap(), 1);
        assert_eq!(read(&ctx, &object, 3usize).to::<i32>().unwrap(), 1);
        assert_eq!(String::from("3").atom(&ctx).unwrap().raw(), 3u32.atom(&ctx).unwrap().raw());
    }

    #[test]
    fn wide_unsigned_keys_keep_every_digit() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        let object = ctx.new_object().unwrap();
        write(&ctx, &object, u64::MAX, 1);
        write(&ctx, &object, i64::MAX as u64, 2);
        assert_eq!(read(&ctx, &object, u64::MAX).to::<i32>().unwrap(), 1);
        assert_eq!(read(&ctx, &object, i64::MAX as u64).to::<i32>().unwrap(), 2);
        assert_eq!(read(&ctx, &object, "18446744073709551615").to::<i32>().unwrap(), 1);
        assert_ne!(
            u64::MAX.atom(&ctx).unwrap().raw(),
            (i64::MAX as u64).atom(&ctx).unwrap().raw()
        );
    }

    #[test]
    fn failed_set_reports_runtime_message() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        let value = ctx.new_value(1).unwrap();
        let err = set(&ctx, qjs::JS_NULL, "x", value.release()).unwrap_err();
        assert!(matches!(err, Error::RuntimeOperationFailed(_)));
        assert_eq!(
            err.to_string(),
            "could not set property 'x': TypeError: cannot set property 'x' of null"
        );
        assert!(ctx.get_exception().is_null());
    }

    #[test]
    fn own_keys_follow_insertion_order() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        let object = ctx.new_object().unwrap();
        write(&ctx, &object, "b", 1);
        write(&ctx, &object, "a", 2);
        write(&ctx, &object, 0u32, 3);
        let keys = OwnKeys::of(&ctx, object.raw()).unwrap();
        let names: Vec<String> = keys
            .atoms()
            .map(|atom| Value::owned(&ctx, keys.key(atom).unwrap()).to_string())
            .collect();
        assert_eq!(names, vec!["0", "b", "a"]);
    }
}
