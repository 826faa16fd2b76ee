//! Execution contexts.
//!
//! A [`Context`] wraps an engine context and carries the binding-level
//! state attached to it: native modules, class prototypes, the module
//! loader and the unhandled rejection callback. Its runtime keeps a table
//! from engine context to binding context, so native callbacks can find
//! their `Context` again ([`Context::from_raw`]).

use std::cell::{Cell, RefCell};
use std::ffi::c_int;
use std::fmt;
use std::path::Path;
use std::ptr;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use bitflags::bitflags;
use rquickjs::qjs;
use rustc_hash::FxHashMap;
use scriptbind_registry::{ClassId, ClassRegistry};
use tracing::debug;

use crate::class::ClassBuilder;
use crate::convert::{FromScript, IntoArgs, ToScript};
use crate::error::{Error, Exception, Result, check, check_status};
use crate::function::Function;
use crate::loader::{self, ModuleData, ModuleLoader};
use crate::module::Module;
use crate::raw;
use crate::runtime::{Runtime, RuntimeInner};
use crate::value::{PromiseState, Value};

bitflags! {
    /// How source text is evaluated.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EvalFlags: u32 {
        /// Global script code.
        const TYPE_GLOBAL = 0;
        /// Module code.
        const TYPE_MODULE = 1;
        const STRICT = 1 << 3;
        /// Compile without running; see [`Context::eval_function`].
        const COMPILE_ONLY = 1 << 5;
    }
}

type RejectionCallback = Rc<dyn Fn(Value)>;

pub(crate) struct ContextInner {
    raw: *mut qjs::JSContext,
    modules: RefCell<FxHashMap<String, Module>>,
    prototypes: RefCell<FxHashMap<ClassId, Value>>,
    module_loader: RefCell<ModuleLoader>,
    on_unhandled_rejection: RefCell<Option<RejectionCallback>>,
    runtime: Runtime,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.runtime.inner().remove_context(self.raw);
        // Values die before the engine context that owns them.
        drop(std::mem::take(&mut *self.modules.borrow_mut()));
        drop(std::mem::take(&mut *self.prototypes.borrow_mut()));
        drop(self.on_unhandled_rejection.borrow_mut().take());
        *self.module_loader.borrow_mut() = Rc::new(loader::default_loader);
        unsafe { qjs::JS_FreeContext(self.raw) };
        debug!("binding context dropped");
    }
}

/// An execution context with its own global object. Cheap to clone.
#[derive(Clone)]
pub struct Context {
    inner: Rc<ContextInner>,
}

impl Context {
    pub fn new(runtime: &Runtime) -> Self {
        let raw = unsafe { qjs::JS_NewContext(runtime.raw()) };
        if raw.is_null() {
            raw::out_of_memory();
        }
        let inner = Rc::new(ContextInner {
            raw,
            modules: RefCell::new(FxHashMap::default()),
            prototypes: RefCell::new(FxHashMap::default()),
            module_loader: RefCell::new(Rc::new(loader::default_loader)),
            on_unhandled_rejection: RefCell::new(None),
            runtime: runtime.clone(),
        });
        runtime.inner().add_context(raw, Rc::downgrade(&inner));
        debug!("binding context created");
        Self { inner }
    }

    /// The binding context of an engine context, if it has one.
    ///
    /// # Safety
    ///
    /// `raw` must be a live engine context.
    pub unsafe fn from_raw(raw: *mut qjs::JSContext) -> Option<Context> {
        let rt = unsafe { qjs::JS_GetRuntime(raw) };
        let inner = unsafe { RuntimeInner::from_raw(rt) }?;
        Self::upgrade(&inner.context(raw)?)
    }

    /// Like [`Context::from_raw`], for engine callbacks.
    pub(crate) fn resolve(raw: *mut qjs::JSContext) -> Result<Context> {
        unsafe { Self::from_raw(raw) }
            .ok_or_else(|| Error::InternalInvariant("engine context has no live binding context".into()))
    }

    pub(crate) fn downgrade(&self) -> Weak<ContextInner> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(inner: &Weak<ContextInner>) -> Option<Context> {
        inner.upgrade().map(|inner| Context { inner })
    }

    pub fn raw(&self) -> *mut qjs::JSContext {
        self.inner.raw
    }

    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    pub fn registry(&self) -> &Arc<ClassRegistry> {
        self.inner.runtime.registry()
    }

    pub fn ptr_eq(&self, other: &Context) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn prototypes(&self) -> &RefCell<FxHashMap<ClassId, Value>> {
        &self.inner.prototypes
    }

    // =========================================================================
    // Values
    // =========================================================================

    pub fn global(&self) -> Value {
        Value::owned(self, unsafe { qjs::JS_GetGlobalObject(self.raw()) })
    }

    pub fn new_object(&self) -> Result<Value> {
        let raw = check(self, unsafe { qjs::JS_NewObject(self.raw()) })?;
        Ok(Value::owned(self, raw))
    }

    pub fn new_array(&self) -> Result<Value> {
        let raw = check(self, unsafe { qjs::JS_NewArray(self.raw()) })?;
        Ok(Value::owned(self, raw))
    }

    /// Convert a native value.
    pub fn new_value<T: ToScript>(&self, value: T) -> Result<Value> {
        let raw = value.to_script(self)?;
        Ok(Value::owned(self, raw))
    }

    /// Take the pending exception; null when there is none.
    pub fn get_exception(&self) -> Value {
        let exception = raw::take_exception(self.raw()).unwrap_or(qjs::JS_NULL);
        Value::owned(self, exception)
    }

    // =========================================================================
    // Evaluation
    // =========================================================================

    /// Evaluate source text.
    ///
    /// In module mode the result is the evaluation promise. A module that
    /// threw an `Error` surfaces as [`Error::Exception`] instead of a
    /// rejected promise.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn eval(&self, source: &str, filename: &str, flags: EvalFlags) -> Result<Value> {
        let result = Value::owned(self, self.compile(source, filename, flags)?);
        if flags.contains(EvalFlags::TYPE_MODULE) && !flags.contains(EvalFlags::COMPILE_ONLY) {
            self.settle_module(result)
        } else {
            Ok(result)
        }
    }

    fn compile(&self, source: &str, filename: &str, flags: EvalFlags) -> Result<qjs::JSValue> {
        let buffer = raw::source_buffer(source);
        let filename = raw::cstring(filename);
        check(self, unsafe {
            qjs::JS_Eval(
                self.raw(),
                buffer.as_ptr().cast(),
                source.len() as _,
                filename.as_ptr(),
                flags.bits() as c_int,
            )
        })
    }

    /// Read and evaluate a file. A module evaluated this way is the main
    /// module: its `import.meta.main` is true.
    pub fn eval_file(&self, path: impl AsRef<Path>, flags: EvalFlags) -> Result<Value> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        let filename = path.to_string_lossy();
        if !flags.contains(EvalFlags::TYPE_MODULE) {
            return self.eval(&source, &filename, flags);
        }
        let compiled = Value::owned(self, self.compile(&source, &filename, flags | EvalFlags::COMPILE_ONLY)?);
        if raw::is_module(compiled.raw()) {
            let def = unsafe { qjs::JS_VALUE_GET_PTR(compiled.raw()) } as *mut qjs::JSModuleDef;
            loader::set_import_meta(self, def, Some(&loader::to_uri(&filename)), true)?;
        }
        if flags.contains(EvalFlags::COMPILE_ONLY) {
            return Ok(compiled);
        }
        self.eval_function(compiled)
    }

    /// Run a script or module compiled with [`EvalFlags::COMPILE_ONLY`].
    pub fn eval_function(&self, compiled: Value) -> Result<Value> {
        let is_module = raw::is_module(compiled.raw());
        let compiled = compiled.to_script(self)?;
        let result = Value::owned(self, check(self, unsafe { qjs::JS_EvalFunction(self.raw(), compiled) })?);
        if is_module {
            self.settle_module(result)
        } else {
            Ok(result)
        }
    }

    fn settle_module(&self, promise: Value) -> Result<Value> {
        if promise.promise_state() == Some(PromiseState::Rejected) {
            let reason = promise.promise_result()?;
            if reason.is_error() {
                let reason = reason.to_script(self)?;
                unsafe { qjs::JS_Throw(self.raw(), reason) };
                return Err(Exception::new(self).into());
            }
        }
        Ok(promise)
    }

    /// Parse JSON text.
    pub fn from_json(&self, text: &str) -> Result<Value> {
        self.from_json_named(text, "<fromJSON>")
    }

    /// Parse JSON text, naming the source in syntax errors.
    pub fn from_json_named(&self, text: &str, filename: &str) -> Result<Value> {
        let buffer = raw::source_buffer(text);
        let filename = raw::cstring(filename);
        let value = check(self, unsafe {
            qjs::JS_ParseJSON(self.raw(), buffer.as_ptr().cast(), text.len() as _, filename.as_ptr())
        })?;
        Ok(Value::owned(self, value))
    }

    // =========================================================================
    // Jobs and promises
    // =========================================================================

    /// Queue `job` to run from [`Runtime::execute_pending_job`]. An error it
    /// returns becomes that job's exception.
    pub fn enqueue_job(&self, job: impl FnOnce() -> Result<()> + 'static) -> Result<()> {
        let job = Cell::new(Some(job));
        let function = self.new_value(Function::new("job", move || -> Result<()> {
            match job.take() {
                Some(job) => job(),
                None => Ok(()),
            }
        }))?;
        let mut args = [function.raw()];
        check_status(self, unsafe {
            qjs::JS_EnqueueJob(self.raw(), Some(run_job), 1, args.as_mut_ptr())
        })?;
        Ok(())
    }

    /// See [`Value::invoke_then`].
    pub fn invoke_then<A, R>(&self, target: &Value, args: A, callback: impl FnOnce(R) + 'static) -> Result<()>
    where
        A: IntoArgs,
        R: FromScript + 'static,
    {
        target.invoke_then(args, callback)
    }

    /// Called with the reason of every promise rejected without a handler.
    pub fn on_unhandled_promise_rejection(&self, callback: impl Fn(Value) + 'static) {
        *self.inner.on_unhandled_rejection.borrow_mut() = Some(Rc::new(callback));
    }

    pub(crate) fn rejection_callback(&self) -> Option<RejectionCallback> {
        self.inner.on_unhandled_rejection.borrow().clone()
    }

    // =========================================================================
    // Modules and classes
    // =========================================================================

    /// Create a native module importable under `name`.
    pub fn add_module(&self, name: &str) -> Result<Module> {
        let module = Module::new(self, name)?;
        self.inner
            .modules
            .borrow_mut()
            .insert(name.to_owned(), module.clone());
        Ok(module)
    }

    /// A native module created with [`Context::add_module`].
    pub fn module(&self, name: &str) -> Option<Module> {
        self.inner.modules.borrow().get(name).cloned()
    }

    pub(crate) fn module_by_def(&self, def: *mut qjs::JSModuleDef) -> Option<Module> {
        self.inner
            .modules
            .borrow()
            .values()
            .find(|module| ptr::eq(module.raw(), def))
            .cloned()
    }

    /// Start registering class `T`. Constructors are exposed on the global
    /// object.
    pub fn register_class<T: ?Sized + 'static>(&self, name: &str) -> Result<ClassBuilder<T>> {
        ClassBuilder::new(self, name, None)
    }

    /// Replace the loader used to resolve imports of unknown modules.
    pub fn set_module_loader(&self, loader: impl Fn(&str) -> Result<ModuleData> + 'static) {
        *self.inner.module_loader.borrow_mut() = Rc::new(loader);
    }

    pub(crate) fn module_loader(&self) -> ModuleLoader {
        self.inner.module_loader.borrow().clone()
    }
}

unsafe extern "C" fn run_job(ctx: *mut qjs::JSContext, argc: c_int, argv: *mut qjs::JSValue) -> qjs::JSValue {
    let args = unsafe { raw::args(argc, argv) };
    match args.first() {
        Some(&job) => unsafe { qjs::JS_Call(ctx, job, qjs::JS_UNDEFINED, 0, ptr::null_mut()) },
        None => qjs::JS_UNDEFINED,
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("modules", &self.inner.modules.borrow().len())
            .finish_non_exhaustive()
    }
}
