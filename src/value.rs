//! Owned handles to runtime values.

use std::cell::Cell;
use std::fmt;
use std::rc::{Rc, Weak};

use rquickjs::qjs;
use scriptbind_registry::Tracer;

use crate::context::{Context, ContextInner, EvalFlags};
use crate::convert::{FromScript, IntoArgs, ToScript, take};
use crate::error::{Error, Result, check, check_status};
use crate::function::{Function, IntoNativeFn};
use crate::property::{self, PropertyKey};
use crate::raw;
use crate::runtime::RuntimeLink;

/// Settlement state of a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

#[derive(Clone)]
struct Owner {
    ctx: Weak<ContextInner>,
    runtime: Rc<RuntimeLink>,
}

/// A reference-counted runtime value.
///
/// A `Value` owns exactly one reference to its raw value while it is bound
/// to a context. Cloning duplicates the reference, dropping releases it.
/// [`Value::release`] hands the reference back to the caller instead.
///
/// The context is held weakly: a value outliving its context releases
/// through the runtime, or not at all once the runtime is gone.
pub struct Value {
    raw: qjs::JSValue,
    owner: Option<Owner>,
}

impl Value {
    pub(crate) fn owned(ctx: &Context, raw: qjs::JSValue) -> Self {
        Self {
            raw,
            owner: Some(Owner {
                ctx: ctx.downgrade(),
                runtime: ctx.runtime().link(),
            }),
        }
    }

    pub(crate) fn borrowed(ctx: &Context, raw: qjs::JSValue) -> Self {
        Self::owned(ctx, raw::dup(raw))
    }

    /// Take ownership of a reference the caller already holds.
    ///
    /// # Safety
    ///
    /// `raw` must be a live value of `ctx`'s runtime, and the caller must
    /// own the reference it hands over.
    pub unsafe fn from_owned(ctx: &Context, raw: qjs::JSValue) -> Self {
        Self::owned(ctx, raw)
    }

    /// Acquire a new reference to a value borrowed from the engine.
    ///
    /// # Safety
    ///
    /// `raw` must be a live value of `ctx`'s runtime.
    pub unsafe fn from_borrowed(ctx: &Context, raw: qjs::JSValue) -> Self {
        Self::borrowed(ctx, raw)
    }

    /// The undefined value, not bound to any context.
    pub fn undefined() -> Self {
        Self {
            raw: qjs::JS_UNDEFINED,
            owner: None,
        }
    }

    pub fn raw(&self) -> qjs::JSValue {
        self.raw
    }

    /// Give up ownership of the reference without releasing it.
    pub fn release(mut self) -> qjs::JSValue {
        self.owner = None;
        self.raw
    }

    /// The context the value belongs to, if it is still alive.
    pub fn context(&self) -> Option<Context> {
        Context::upgrade(&self.owner.as_ref()?.ctx)
    }

    fn bound(&self) -> Result<Context> {
        self.context()
            .ok_or_else(|| Error::InternalInvariant("value is not bound to a live context".into()))
    }

    /// Whether the reference lives in the runtime `rt`.
    pub(crate) fn belongs_to(&self, rt: *mut qjs::JSRuntime) -> bool {
        self.owner.as_ref().is_some_and(|owner| owner.runtime.get() == rt)
    }

    /// Report this value to the cycle collector.
    ///
    /// For use in mark functions of classes holding values.
    pub fn trace(&self, tracer: &mut Tracer<'_>) {
        if self.belongs_to(tracer.runtime()) {
            // SAFETY: the value is a live reference of the runtime being
            // collected, owned by the object whose mark hook runs.
            unsafe { tracer.mark(self.raw) };
        }
    }

    // =========================================================================
    // Type checks
    // =========================================================================

    pub fn is_undefined(&self) -> bool {
        raw::is_undefined(self.raw)
    }

    pub fn is_null(&self) -> bool {
        raw::is_null(self.raw)
    }

    pub fn is_number(&self) -> bool {
        raw::is_number(self.raw)
    }

    pub fn is_string(&self) -> bool {
        raw::is_string(self.raw)
    }

    pub fn is_object(&self) -> bool {
        raw::is_object(self.raw)
    }

    pub fn is_array(&self) -> bool {
        self.with_context(|ctx| raw::truthy(unsafe { qjs::JS_IsArray(ctx, self.raw) }))
    }

    pub fn is_error(&self) -> bool {
        self.with_context(|ctx| raw::truthy(unsafe { qjs::JS_IsError(ctx, self.raw) }))
    }

    pub fn is_function(&self) -> bool {
        self.with_context(|ctx| raw::truthy(unsafe { qjs::JS_IsFunction(ctx, self.raw) }))
    }

    pub fn is_promise(&self) -> bool {
        self.promise_state().is_some()
    }

    /// Result of the runtime's `typeof` operator.
    pub fn type_of(&self) -> &'static str {
        match self.context() {
            Some(ctx) => raw::type_of(ctx.raw(), self.raw),
            None => raw::tag_name(self.raw),
        }
    }

    fn with_context(&self, f: impl FnOnce(*mut qjs::JSContext) -> bool) -> bool {
        raw::is_object(self.raw) && self.context().is_some_and(|ctx| f(ctx.raw()))
    }

    // =========================================================================
    // Conversion
    // =========================================================================

    /// Convert to a native type.
    pub fn to<T: FromScript>(&self) -> Result<T> {
        let ctx = self.bound()?;
        T::from_script(&ctx, self.raw)
    }

    /// Serialize as JSON text.
    pub fn to_json(&self) -> Result<String> {
        self.to_json_with(Value::undefined(), Value::undefined())
    }

    /// Serialize as JSON text with a replacer (function or key list) and an
    /// indent (count or string).
    pub fn to_json_with<R: ToScript, S: ToScript>(&self, replacer: R, space: S) -> Result<String> {
        let ctx = self.bound()?;
        let replacer = ctx.new_value(replacer)?;
        let space = ctx.new_value(space)?;
        let text = check(&ctx, unsafe {
            qjs::JS_JSONStringify(ctx.raw(), self.raw, replacer.raw(), space.raw())
        })?;
        if raw::is_undefined(text) {
            return Err(Error::type_mismatch("value has no JSON representation"));
        }
        take(&ctx, text)
    }

    // =========================================================================
    // Properties
    // =========================================================================

    pub fn get<K: PropertyKey>(&self, key: K) -> Result<Value> {
        let ctx = self.bound()?;
        let value = property::get(&ctx, self.raw, &key)?;
        Ok(Value::owned(&ctx, value))
    }

    /// Read a property and convert it.
    pub fn get_as<T: FromScript, K: PropertyKey>(&self, key: K) -> Result<T> {
        let ctx = self.bound()?;
        let value = property::get(&ctx, self.raw, &key)?;
        take(&ctx, value)
    }

    pub fn set<K: PropertyKey, V: ToScript>(&self, key: K, value: V) -> Result<&Self> {
        let ctx = self.bound()?;
        let value = value.to_script(&ctx)?;
        property::set(&ctx, self.raw, &key, value)?;
        Ok(self)
    }

    /// Wrap `f` and store it under `name`.
    pub fn set_function<F, Args, R>(&self, name: &str, f: F) -> Result<&Self>
    where
        F: IntoNativeFn<Args, R>,
        Args: 'static,
        R: ToScript + 'static,
    {
        self.set(name, Function::new(name, f))
    }

    /// Define a read-only accessor property.
    pub fn add_getter<F, Args, R>(&self, name: &str, getter: F) -> Result<&Self>
    where
        F: IntoNativeFn<Args, R>,
        Args: 'static,
        R: ToScript + 'static,
    {
        self.define_accessor(name, Function::new(name, getter), None)
    }

    /// Define an accessor property with a getter and a setter.
    pub fn add_getter_setter<G, GArgs, GR, S, SArgs, SR>(&self, name: &str, getter: G, setter: S) -> Result<&Self>
    where
        G: IntoNativeFn<GArgs, GR>,
        GArgs: 'static,
        GR: ToScript + 'static,
        S: IntoNativeFn<SArgs, SR>,
        SArgs: 'static,
        SR: ToScript + 'static,
    {
        self.define_accessor(name, Function::new(name, getter), Some(Function::new(name, setter)))
    }

    pub(crate) fn define_accessor(&self, name: &str, getter: Function, setter: Option<Function>) -> Result<&Self> {
        let ctx = self.bound()?;
        let getter = ctx.new_value(getter)?;
        let setter = match setter {
            Some(setter) => ctx.new_value(setter)?,
            None => Value::undefined(),
        };
        let atom = name.atom(&ctx)?;
        check_status(&ctx, unsafe {
            qjs::JS_DefinePropertyGetSet(
                ctx.raw(),
                self.raw,
                atom.raw(),
                getter.release(),
                setter.release(),
                qjs::JS_PROP_ENUMERABLE as _,
            )
        })?;
        Ok(self)
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Call this value with `undefined` as receiver.
    pub fn call<A: IntoArgs>(&self, args: A) -> Result<Value> {
        self.call_with_this(&Value::undefined(), args)
    }

    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn call_with_this<A: IntoArgs>(&self, this: &Value, args: A) -> Result<Value> {
        let ctx = self.bound()?;
        let args = args.into_args(&ctx)?;
        let mut raw_args: Vec<qjs::JSValue> = args.iter().map(Value::raw).collect();
        let result = check(&ctx, unsafe {
            qjs::JS_Call(
                ctx.raw(),
                self.raw,
                this.raw,
                raw_args.len() as _,
                raw_args.as_mut_ptr(),
            )
        })?;
        Ok(Value::owned(&ctx, result))
    }

    /// Call this value as a constructor.
    pub fn construct<A: IntoArgs>(&self, args: A) -> Result<Value> {
        let ctx = self.bound()?;
        let args = args.into_args(&ctx)?;
        let mut raw_args: Vec<qjs::JSValue> = args.iter().map(Value::raw).collect();
        let result = check(&ctx, unsafe {
            qjs::JS_CallConstructor(ctx.raw(), self.raw, raw_args.len() as _, raw_args.as_mut_ptr())
        })?;
        Ok(Value::owned(&ctx, result))
    }

    /// Evaluate a script with this value as `this`.
    pub fn eval_this(&self, source: &str) -> Result<Value> {
        let ctx = self.bound()?;
        let buffer = raw::source_buffer(source);
        let result = check(&ctx, unsafe {
            qjs::JS_EvalThis(
                ctx.raw(),
                self.raw,
                buffer.as_ptr().cast(),
                source.len() as _,
                c"<evalThis>".as_ptr(),
                EvalFlags::TYPE_GLOBAL.bits() as _,
            )
        })?;
        Ok(Value::owned(&ctx, result))
    }

    // =========================================================================
    // Promises
    // =========================================================================

    /// State of a promise; `None` for other values.
    pub fn promise_state(&self) -> Option<PromiseState> {
        if !raw::is_object(self.raw) {
            return None;
        }
        let ctx = self.context()?;
        match unsafe { qjs::JS_PromiseState(ctx.raw(), self.raw) } as i64 {
            0 => Some(PromiseState::Pending),
            1 => Some(PromiseState::Fulfilled),
            2 => Some(PromiseState::Rejected),
            _ => None,
        }
    }

    /// Fulfillment value or rejection reason of a settled promise.
    pub fn promise_result(&self) -> Result<Value> {
        let ctx = self.bound()?;
        if !self.is_promise() {
            return Err(Error::type_mismatch("value is not a promise"));
        }
        let result = unsafe { qjs::JS_PromiseResult(ctx.raw(), self.raw) };
        Ok(Value::owned(&ctx, result))
    }

    /// Deliver the eventual result of this value to `callback`.
    ///
    /// A pending promise delivers its fulfillment value once settled, a
    /// fulfilled one delivers it now. A function is called with `args`
    /// first; a promise it returns is followed the same way. Rejected
    /// promises and other values fail.
    pub fn invoke_then<A, R>(&self, args: A, callback: impl FnOnce(R) + 'static) -> Result<()>
    where
        A: IntoArgs,
        R: FromScript + 'static,
    {
        self.bound()?;
        match self.promise_state() {
            Some(PromiseState::Pending) => {
                let callback = Cell::new(Some(callback));
                let continuation = Function::new("then", move |value: R| {
                    if let Some(callback) = callback.take() {
                        callback(value);
                    }
                });
                let then = self.get("then")?;
                then.call_with_this(self, (continuation,))?;
                Ok(())
            }
            Some(PromiseState::Fulfilled) => {
                let value = self.promise_result()?;
                callback(value.to()?);
                Ok(())
            }
            None if self.is_function() => {
                let result = self.call(args)?;
                if result.is_promise() {
                    result.invoke_then((), callback)
                } else {
                    callback(result.to()?);
                    Ok(())
                }
            }
            _ => Err(Error::RuntimeOperationFailed(
                "value is either non-invocable or a rejected promise".into(),
            )),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::undefined()
    }
}

impl Clone for Value {
    fn clone(&self) -> Self {
        let raw = match &self.owner {
            Some(owner) if !owner.runtime.get().is_null() => raw::dup(self.raw),
            _ => self.raw,
        };
        Self {
            raw,
            owner: self.owner.clone(),
        }
    }
}

impl Drop for Value {
    fn drop(&mut self) {
        let Some(owner) = self.owner.take() else {
            return;
        };
        let rt = owner.runtime.get();
        if !rt.is_null() {
            unsafe { qjs::JS_FreeValueRT(rt, self.raw) };
        }
    }
}

/// Identity: same tag and same payload or reference.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        raw::same_identity(self.raw, other.raw)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Value").field(&raw::tag_name(self.raw)).finish()
    }
}

/// Runtime string coercion. Falls back to the value's tag when the
/// coercion throws.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(ctx) = self.context() else {
            return write!(f, "[{}]", raw::tag_name(self.raw));
        };
        match raw::to_string(ctx.raw(), self.raw) {
            Some(text) => f.write_str(&text),
            None => {
                raw::clear_exception(ctx.raw());
                write!(f, "[{}]", raw::tag_name(self.raw))
            }
        }
    }
}
