//! Exposing native types as runtime classes.
//!
//! Instances live in the opaque slot of runtime objects as a
//! [`BoundPtr`]: `Rc<T>` converts into an object that shares ownership,
//! `Weak<T>` into one that only observes. Converting back recovers the
//! instance through the class registry, so an object of a derived class
//! unwraps as any of its bases.
//!
//! # Example
//!
//! ```
//! use std::rc::Rc;
//! use scriptbind::{Context, EvalFlags, Runtime};
//!
//! struct Counter {
//!     start: i32,
//! }
//!
//! let rt = Runtime::new();
//! let ctx = Context::new(&rt);
//! ctx.register_class::<Counter>("Counter")?
//!     .constructor(|start: i32| Counter { start })?
//!     .method("next", |c: Rc<Counter>| c.start + 1)?
//!     .property("start", |c: Rc<Counter>| c.start)?
//!     .build()?;
//!
//! let next = ctx.eval("new Counter(41).next()", "<doc>", EvalFlags::TYPE_GLOBAL)?;
//! assert_eq!(next.to::<i32>()?, 42);
//! # Ok::<(), scriptbind::Error>(())
//! ```

use std::any::{Any, type_name};
use std::ffi::c_int;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use rquickjs::qjs;
use scriptbind_registry::{BoundPtr, CastError, ClassId, Tracer};
use tracing::{debug, trace, warn};

use crate::context::Context;
use crate::convert::{FromScript, ToScript};
use crate::error::{Error, Result, boundary, check, check_status, guard};
use crate::function::{Function, IntoNativeFn};
use crate::module::Module;
use crate::raw;
use crate::runtime::{Runtime, RuntimeInner};
use crate::value::Value;

/// What the opaque slot of a bound object points to: a boxed
/// `BoundPtr<T>` of the object's class.
pub(crate) type Payload = Box<dyn Any>;

pub(crate) type CallHook = Rc<dyn Fn(&Context, qjs::JSValue, &[qjs::JSValue]) -> Result<qjs::JSValue>>;

/// Optional behavior installed with a class definition.
#[derive(Clone, Default)]
pub(crate) struct Hooks {
    pub(crate) call: Option<CallHook>,
    pub(crate) exotic: Option<Rc<dyn ExoticMethods>>,
}

impl Hooks {
    fn is_empty(&self) -> bool {
        self.call.is_none() && self.exotic.is_none()
    }
}

/// Key of a property lookup seen by [`ExoticMethods`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropertyName {
    /// A canonical array index.
    Index(u32),
    Name(String),
}

impl PropertyName {
    /// `None` for symbol keys.
    fn from_atom(ctx: &Context, atom: qjs::JSAtom) -> Result<Option<Self>> {
        let key = Value::owned(ctx, check(ctx, unsafe { qjs::JS_AtomToValue(ctx.raw(), atom) })?);
        if !key.is_string() {
            return Ok(None);
        }
        let name = key.to::<String>()?;
        Ok(Some(match name.parse::<u32>() {
            Ok(index) if index != u32::MAX && index.to_string() == name => PropertyName::Index(index),
            _ => PropertyName::Name(name),
        }))
    }
}

impl fmt::Display for PropertyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyName::Index(index) => write!(f, "{index}"),
            PropertyName::Name(name) => f.write_str(name),
        }
    }
}

/// Property lookup hooks for instances of a class.
pub trait ExoticMethods {
    /// The own property `key` of `object`, or `None` to continue with
    /// ordinary lookup. Symbol keys never reach the hook.
    fn get_own(&self, ctx: &Context, object: &Value, key: &PropertyName) -> Result<Option<Value>>;
}

/// Fluent registration of a native class in one context.
///
/// Created by [`Context::register_class`] or [`Module::register_class`].
/// Members are attached to the prototype as they are added; [`build`]
/// installs the class definition in the runtime and must be called last.
///
/// [`build`]: ClassBuilder::build
pub struct ClassBuilder<T: ?Sized + 'static> {
    ctx: Context,
    module: Option<Module>,
    name: String,
    id: ClassId,
    prototype: Value,
    constructor: Option<Value>,
    hooks: Hooks,
    _marker: PhantomData<fn(&T)>,
}

impl<T: ?Sized + 'static> ClassBuilder<T> {
    pub(crate) fn new(ctx: &Context, name: &str, module: Option<Module>) -> Result<Self> {
        let id = ctx.registry().class_id::<T>();
        // A class registered earlier with this one as its base may already
        // have handed out the prototype.
        let prototype = ctx.class_prototype(id)?;
        Ok(Self {
            ctx: ctx.clone(),
            module,
            name: name.to_owned(),
            id,
            prototype,
            constructor: None,
            hooks: Hooks::default(),
            _marker: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class_id(&self) -> ClassId {
        self.id
    }

    /// The prototype shared by instances of the class.
    pub fn prototype(&self) -> &Value {
        &self.prototype
    }

    // =========================================================================
    // Members
    // =========================================================================

    /// Add a method. The receiver is converted as the first parameter,
    /// usually an `Rc<T>`.
    pub fn method<F, Args, R>(self, name: &str, f: F) -> Result<Self>
    where
        F: IntoNativeFn<Args, R>,
        Args: 'static,
        R: ToScript + 'static,
    {
        self.prototype.set(name, Function::with_this(name, f))?;
        Ok(self)
    }

    /// Add a read-only property computed from the receiver.
    pub fn property<F, Args, R>(self, name: &str, getter: F) -> Result<Self>
    where
        F: IntoNativeFn<Args, R>,
        Args: 'static,
        R: ToScript + 'static,
    {
        self.prototype
            .define_accessor(name, Function::with_this(name, getter), None)?;
        Ok(self)
    }

    /// Add a property with a getter and a setter; both take the receiver
    /// first.
    pub fn property_with_setter<G, GArgs, GR, S, SArgs, SR>(self, name: &str, getter: G, setter: S) -> Result<Self>
    where
        G: IntoNativeFn<GArgs, GR>,
        GArgs: 'static,
        GR: ToScript + 'static,
        S: IntoNativeFn<SArgs, SR>,
        SArgs: 'static,
        SR: ToScript + 'static,
    {
        self.prototype.define_accessor(
            name,
            Function::with_this(name, getter),
            Some(Function::with_this(name, setter)),
        )?;
        Ok(self)
    }

    /// Add a function to the constructor.
    pub fn static_method<F, Args, R>(self, name: &str, f: F) -> Result<Self>
    where
        F: IntoNativeFn<Args, R>,
        Args: 'static,
        R: ToScript + 'static,
    {
        self.constructor_value()?.set(name, Function::new(name, f))?;
        Ok(self)
    }

    /// Add a value to the constructor.
    pub fn static_value<V: ToScript>(self, name: &str, value: V) -> Result<Self> {
        self.constructor_value()?.set(name, value)?;
        Ok(self)
    }

    fn constructor_value(&self) -> Result<&Value> {
        self.constructor.as_ref().ok_or_else(|| {
            Error::RuntimeOperationFailed(format!(
                "class '{}' needs a constructor before static members",
                self.name
            ))
        })
    }

    // =========================================================================
    // Hierarchy and collection
    // =========================================================================

    /// Declare `B` as a base of `T`.
    ///
    /// Objects of class `T`, and of every class derived from it, then
    /// unwrap as `Rc<B>`, and the prototype of `T` inherits from the one of
    /// `B`. `B` does not need to be registered yet.
    pub fn base<B>(self, upcast: impl Fn(Rc<T>) -> Rc<B> + Send + Sync + 'static) -> Result<Self>
    where
        B: ?Sized + 'static,
    {
        let registry = self.ctx.registry();
        registry
            .register_derived::<T, B>(upcast)
            .map_err(|err| Error::RuntimeOperationFailed(err.to_string()))?;
        let base_proto = self.ctx.class_prototype(registry.class_id::<B>())?;
        check_status(&self.ctx, unsafe {
            qjs::JS_SetPrototype(self.ctx.raw(), self.prototype.raw(), base_proto.raw())
        })?;
        Ok(self)
    }

    /// Report the runtime values an instance holds, so cycles running
    /// through native objects can be collected. Applies to derived classes
    /// too, and to instances that already exist.
    pub fn mark(self, mark: impl Fn(&T, &mut Tracer<'_>) + Send + Sync + 'static) -> Self {
        self.ctx.registry().add_mark::<T>(mark);
        self
    }

    /// Make instances callable. The called object is converted as the first
    /// parameter.
    pub fn callable<F, Args, R>(mut self, f: F) -> Self
    where
        F: IntoNativeFn<Args, R>,
        Args: 'static,
        R: ToScript + 'static,
    {
        let call: CallHook = Rc::new(move |ctx: &Context, object: qjs::JSValue, args: &[qjs::JSValue]| {
            f.invoke(ctx, object, args, true)?.to_script(ctx)
        });
        self.hooks.call = Some(call);
        self
    }

    /// Consult `hooks` before ordinary property lookup on instances.
    pub fn exotic(mut self, hooks: impl ExoticMethods + 'static) -> Self {
        self.hooks.exotic = Some(Rc::new(hooks));
        self
    }

    /// Install the class definition in the runtime.
    ///
    /// A runtime installs each class once, when its first instance or its
    /// builder needs it. Call and lookup hooks must be given before that.
    pub fn build(self) -> Result<()> {
        install::<T>(self.ctx.runtime(), &self.name, self.hooks)?;
        debug!(class = %self.name, id = %self.id, module = ?self.module.as_ref().map(Module::name), "class registered");
        Ok(())
    }
}

impl<T: 'static> ClassBuilder<T> {
    /// Add a constructor named after the class.
    pub fn constructor<F, Args>(self, f: F) -> Result<Self>
    where
        F: IntoNativeFn<Args, T>,
        Args: 'static,
    {
        let name = self.name.clone();
        self.named_constructor(&name, f)
    }

    /// Add a constructor under its own name.
    ///
    /// It is exported from the builder's module, or set on the global
    /// object. The first constructor added holds static members.
    pub fn named_constructor<F, Args>(mut self, name: &str, f: F) -> Result<Self>
    where
        F: IntoNativeFn<Args, T>,
        Args: 'static,
    {
        let id = self.id;
        let length = u32::try_from(F::REQUIRED).unwrap_or(u32::MAX);
        let function = Function::from_raw_parts(name.to_owned(), length, move |ctx, new_target, args| {
            let instance = f.invoke(ctx, new_target, args, false)?;
            construct(ctx, id, new_target, BoundPtr::Shared(Rc::new(instance)))
        })
        .into_constructor();
        let ctor = self.ctx.new_value(function)?;
        unsafe { qjs::JS_SetConstructor(self.ctx.raw(), ctor.raw(), self.prototype.raw()) };
        match &self.module {
            Some(module) => {
                module.add(name, &ctor)?;
            }
            None => {
                self.ctx.global().set(name, &ctor)?;
            }
        }
        if self.constructor.is_none() {
            self.constructor = Some(ctor);
        }
        Ok(self)
    }
}

impl<T: ?Sized + 'static> fmt::Debug for ClassBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassBuilder")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("constructor", &self.constructor.is_some())
            .finish_non_exhaustive()
    }
}

/// Allocate the object for a `new` call and move the instance into it.
fn construct<T: ?Sized + 'static>(
    ctx: &Context,
    id: ClassId,
    new_target: qjs::JSValue,
    instance: BoundPtr<T>,
) -> Result<qjs::JSValue> {
    let proto = Value::borrowed(ctx, new_target).get("prototype")?;
    let proto = if proto.is_object() {
        proto
    } else {
        ctx.class_prototype(id)?
    };
    ctx.new_instance(instance, Some(&proto))
}

// =============================================================================
// Class definitions
// =============================================================================

/// Install class `T` in the runtime unless it already is.
///
/// Hooks can only come with the first installation.
pub(crate) fn install<T: ?Sized + 'static>(runtime: &Runtime, name: &str, hooks: Hooks) -> Result<ClassId> {
    let id = runtime.registry().class_id::<T>();
    let rt = runtime.raw();
    if raw::truthy(unsafe { qjs::JS_IsRegisteredClass(rt, id.raw()) }) {
        if !hooks.is_empty() {
            return Err(Error::RuntimeOperationFailed(format!(
                "class '{name}' is already installed; call and lookup hooks must be set before its first instance"
            )));
        }
        return Ok(id);
    }

    let class_name = raw::cstring(name);
    // SAFETY: every field the engine reads is either set below or null.
    let mut def: qjs::JSClassDef = unsafe { std::mem::zeroed() };
    def.class_name = class_name.as_ptr();
    def.finalizer = Some(finalize::<T>);
    def.gc_mark = Some(gc_mark::<T>);
    if hooks.call.is_some() {
        def.call = Some(call_instance::<T>);
    }
    if hooks.exotic.is_some() {
        // SAFETY: as above.
        let mut exotic: qjs::JSClassExoticMethods = unsafe { std::mem::zeroed() };
        exotic.get_own_property = Some(exotic_get_own::<T>);
        def.exotic = runtime.inner().keep_exotic_table(exotic);
    }
    if unsafe { qjs::JS_NewClass(rt, id.raw(), &def) } < 0 {
        return Err(Error::RuntimeOperationFailed(format!("could not install class '{name}'")));
    }
    if !hooks.is_empty() {
        runtime.inner().set_hooks(id, hooks);
    }
    trace!(class = name, %id, "class installed");
    Ok(id)
}

unsafe fn payload<'a>(value: qjs::JSValue, id: ClassId) -> Option<&'a Payload> {
    let payload = unsafe { qjs::JS_GetOpaque(value, id.raw()) } as *const Payload;
    unsafe { payload.as_ref() }
}

unsafe extern "C" fn finalize<T: ?Sized + 'static>(rt: *mut qjs::JSRuntime, value: qjs::JSValue) {
    let Some(inner) = (unsafe { RuntimeInner::from_raw(rt) }) else {
        return;
    };
    let Some(id) = inner.registry().lookup::<T>() else {
        return;
    };
    let payload = unsafe { qjs::JS_GetOpaque(value, id.raw()) } as *mut Payload;
    if payload.is_null() {
        return;
    }
    let payload = unsafe { Box::from_raw(payload) };
    trace!(class = type_name::<T>(), "finalizing instance");
    if panic::catch_unwind(AssertUnwindSafe(move || drop(payload))).is_err() {
        warn!(class = type_name::<T>(), "native instance panicked while dropping");
    }
}

unsafe extern "C" fn gc_mark<T: ?Sized + 'static>(
    rt: *mut qjs::JSRuntime,
    value: qjs::JSValue,
    mark: qjs::JS_MarkFunc,
) {
    let Some(inner) = (unsafe { RuntimeInner::from_raw(rt) }) else {
        return;
    };
    let registry = inner.registry();
    let Some(id) = registry.lookup::<T>() else {
        return;
    };
    let Some(payload) = (unsafe { payload(value, id) }) else {
        return;
    };
    let mut tracer = unsafe { Tracer::new(rt, mark) };
    if panic::catch_unwind(AssertUnwindSafe(|| registry.trace(id, &**payload, &mut tracer))).is_err() {
        warn!(class = type_name::<T>(), "mark function panicked");
    }
}

unsafe extern "C" fn call_instance<T: ?Sized + 'static>(
    ctx: *mut qjs::JSContext,
    object: qjs::JSValue,
    _this: qjs::JSValue,
    argc: c_int,
    argv: *mut qjs::JSValue,
    _flags: c_int,
) -> qjs::JSValue {
    let args = unsafe { raw::args(argc, argv) };
    guard(ctx, || {
        let context = Context::resolve(ctx)?;
        let call = context
            .registry()
            .lookup::<T>()
            .and_then(|id| context.runtime().inner().hooks(id))
            .and_then(|hooks| hooks.call)
            .ok_or_else(|| Error::InternalInvariant(format!("class {} has no call hook", type_name::<T>())))?;
        call(&context, object, args)
    })
}

unsafe extern "C" fn exotic_get_own<T: ?Sized + 'static>(
    ctx: *mut qjs::JSContext,
    desc: *mut qjs::JSPropertyDescriptor,
    object: qjs::JSValue,
    atom: qjs::JSAtom,
) -> c_int {
    let found = boundary(ctx, || {
        let context = Context::resolve(ctx)?;
        let Some(exotic) = context
            .registry()
            .lookup::<T>()
            .and_then(|id| context.runtime().inner().hooks(id))
            .and_then(|hooks| hooks.exotic)
        else {
            return Ok(None);
        };
        let Some(key) = PropertyName::from_atom(&context, atom)? else {
            return Ok(None);
        };
        let object = Value::borrowed(&context, object);
        exotic
            .get_own(&context, &object, &key)?
            .map(|value| value.to_script(&context))
            .transpose()
    });
    match found {
        None => -1,
        Some(None) => 0,
        Some(Some(value)) => {
            if desc.is_null() {
                unsafe { qjs::JS_FreeValue(ctx, value) };
            } else {
                let flags = qjs::JS_PROP_ENUMERABLE | qjs::JS_PROP_WRITABLE | qjs::JS_PROP_CONFIGURABLE;
                unsafe {
                    (*desc).flags = flags as c_int;
                    (*desc).value = value;
                    (*desc).getter = qjs::JS_UNDEFINED;
                    (*desc).setter = qjs::JS_UNDEFINED;
                }
            }
            1
        }
    }
}

impl Context {
    /// Prototype of class `id` in this context, created on first use.
    pub(crate) fn class_prototype(&self, id: ClassId) -> Result<Value> {
        if let Some(prototype) = self.prototypes().borrow().get(&id) {
            return Ok(prototype.clone());
        }
        let prototype = self.new_object()?;
        self.prototypes().borrow_mut().insert(id, prototype.clone());
        Ok(prototype)
    }

    /// New object of class `T` holding `instance`.
    ///
    /// Without an explicit prototype the object gets the class prototype
    /// of this context.
    pub(crate) fn new_instance<T: ?Sized + 'static>(
        &self,
        instance: BoundPtr<T>,
        prototype: Option<&Value>,
    ) -> Result<qjs::JSValue> {
        let id = install::<T>(self.runtime(), type_name::<T>(), Hooks::default())?;
        let prototype = match prototype {
            Some(prototype) => prototype.clone(),
            None => self.class_prototype(id)?,
        };
        let object = check(self, unsafe {
            qjs::JS_NewObjectProtoClass(self.raw(), prototype.raw(), id.raw())
        })?;
        let payload: Box<Payload> = Box::new(Box::new(instance));
        unsafe { qjs::JS_SetOpaque(object, Box::into_raw(payload).cast()) };
        Ok(object)
    }
}

// =============================================================================
// Conversions
// =============================================================================

fn cast_error(err: CastError) -> Error {
    match err {
        CastError::Unrelated { .. } => Error::TypeMismatch(err.to_string()),
        CastError::Null => Error::InternalInvariant(err.to_string()),
    }
}

/// Recovers the instance of an object of class `T` or of any class derived
/// from it.
impl<T: ?Sized + 'static> FromScript for Rc<T> {
    fn from_script(ctx: &Context, value: qjs::JSValue) -> Result<Self> {
        if !raw::is_object(value) {
            return Err(Error::TypeMismatch(format!(
                "Expected type {}, got {}",
                type_name::<T>(),
                raw::describe(ctx.raw(), value)
            )));
        }
        let registry = ctx.registry();
        if let Some(id) = registry.lookup::<T>() {
            let classes = std::iter::once(id).chain(registry.derived_classes(id));
            for class in classes {
                if let Some(payload) = unsafe { payload(value, class) } {
                    return registry.recover::<T>(class, &**payload).map_err(cast_error);
                }
            }
        }
        let actual = registry
            .class_ids()
            .into_iter()
            .find(|&class| unsafe { payload(value, class) }.is_some());
        Err(match actual {
            Some(actual) => cast_error(CastError::Unrelated {
                expected: type_name::<T>(),
                actual,
            }),
            None => Error::TypeMismatch(format!("Expected type {}, got object", type_name::<T>())),
        })
    }
}

impl<T: ?Sized + 'static> ToScript for Rc<T> {
    fn to_script(self, ctx: &Context) -> Result<qjs::JSValue> {
        ctx.new_instance(BoundPtr::Shared(self), None)
    }
}

/// The object does not keep the instance alive; a dropped instance
/// converts to null.
impl<T: ?Sized + 'static> ToScript for Weak<T> {
    fn to_script(self, ctx: &Context) -> Result<qjs::JSValue> {
        if self.strong_count() == 0 {
            return Ok(qjs::JS_NULL);
        }
        ctx.new_instance(BoundPtr::Borrowed(self), None)
    }
}

/// `null` reads as an empty reference.
impl<T: 'static> FromScript for Weak<T> {
    fn from_script(ctx: &Context, value: qjs::JSValue) -> Result<Self> {
        if raw::is_null(value) {
            return Ok(Weak::new());
        }
        Rc::<T>::from_script(ctx, value).map(|rc| Rc::downgrade(&rc))
    }
}
