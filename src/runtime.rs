//! Runtimes and their configuration.
//!
//! A [`Runtime`] owns the engine runtime together with the state native
//! callbacks need to find again from a raw pointer: the class registry,
//! the installed class hooks and the table of live contexts. The engine
//! runtime's opaque slot points at that state.

use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use rquickjs::qjs;
use rustc_hash::FxHashMap;
use scriptbind_registry::{ClassId, ClassRegistry};
use tracing::{debug, trace, warn};

use crate::class::{self, Hooks};
use crate::context::{Context, ContextInner};
use crate::error::{Error, Exception, Result};
use crate::function::Descriptor;
use crate::loader;
use crate::raw;
use crate::value::Value;

/// Default stack limit, in bytes.
pub const DEFAULT_MAX_STACK_SIZE: usize = 256 * 1024;

/// Default allocation volume between automatic cycle collections.
pub const DEFAULT_GC_THRESHOLD: usize = 256 * 1024;

/// Settings applied when a [`Runtime`] is created.
#[derive(Clone)]
pub struct RuntimeOptions {
    /// Bytes allocated between automatic cycle collections; 0 disables them.
    pub gc_threshold: usize,
    /// Stack space scripts may use, in bytes; 0 removes the limit.
    pub max_stack_size: usize,
    /// Upper bound on engine memory, in bytes.
    pub memory_limit: Option<usize>,
    /// Class registry shared with other runtimes.
    pub registry: Arc<ClassRegistry>,
}

impl RuntimeOptions {
    pub fn gc_threshold(mut self, threshold: usize) -> Self {
        self.gc_threshold = threshold;
        self
    }

    pub fn max_stack_size(mut self, bytes: usize) -> Self {
        self.max_stack_size = bytes;
        self
    }

    pub fn memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn registry(mut self, registry: Arc<ClassRegistry>) -> Self {
        self.registry = registry;
        self
    }
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            gc_threshold: DEFAULT_GC_THRESHOLD,
            max_stack_size: DEFAULT_MAX_STACK_SIZE,
            memory_limit: None,
            registry: ClassRegistry::global(),
        }
    }
}

impl fmt::Debug for RuntimeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeOptions")
            .field("gc_threshold", &self.gc_threshold)
            .field("max_stack_size", &self.max_stack_size)
            .field("memory_limit", &self.memory_limit)
            .field("classes", &self.registry.len())
            .finish()
    }
}

/// Raw runtime pointer shared with values; null once the runtime is freed.
pub(crate) struct RuntimeLink(Cell<*mut qjs::JSRuntime>);

impl RuntimeLink {
    pub(crate) fn get(&self) -> *mut qjs::JSRuntime {
        self.0.get()
    }
}

pub(crate) struct RuntimeInner {
    raw: *mut qjs::JSRuntime,
    link: Rc<RuntimeLink>,
    registry: Arc<ClassRegistry>,
    contexts: RefCell<FxHashMap<usize, Weak<ContextInner>>>,
    hooks: RefCell<FxHashMap<ClassId, Hooks>>,
    exotic_tables: RefCell<Vec<Box<qjs::JSClassExoticMethods>>>,
    function_class: ClassId,
}

impl RuntimeInner {
    /// The state behind an engine runtime created by [`Runtime`].
    ///
    /// # Safety
    ///
    /// `rt` must be a live engine runtime.
    pub(crate) unsafe fn from_raw<'a>(rt: *mut qjs::JSRuntime) -> Option<&'a RuntimeInner> {
        let inner = unsafe { qjs::JS_GetRuntimeOpaque(rt) } as *const RuntimeInner;
        unsafe { inner.as_ref() }
    }

    pub(crate) fn registry(&self) -> &Arc<ClassRegistry> {
        &self.registry
    }

    pub(crate) fn context(&self, raw: *mut qjs::JSContext) -> Option<Weak<ContextInner>> {
        self.contexts.borrow().get(&(raw as usize)).cloned()
    }

    pub(crate) fn add_context(&self, raw: *mut qjs::JSContext, inner: Weak<ContextInner>) {
        self.contexts.borrow_mut().insert(raw as usize, inner);
    }

    pub(crate) fn remove_context(&self, raw: *mut qjs::JSContext) {
        self.contexts.borrow_mut().remove(&(raw as usize));
    }

    pub(crate) fn hooks(&self, id: ClassId) -> Option<Hooks> {
        self.hooks.borrow().get(&id).cloned()
    }

    pub(crate) fn set_hooks(&self, id: ClassId, hooks: Hooks) {
        self.hooks.borrow_mut().insert(id, hooks);
    }

    /// Keep a lookup table alive for as long as the engine may read it.
    pub(crate) fn keep_exotic_table(&self, table: qjs::JSClassExoticMethods) -> *mut qjs::JSClassExoticMethods {
        let mut table = Box::new(table);
        let ptr: *mut qjs::JSClassExoticMethods = &mut *table;
        self.exotic_tables.borrow_mut().push(table);
        ptr
    }

    fn live_objects(&self) -> i64 {
        // SAFETY: a zeroed usage record is a valid output buffer.
        let mut usage: qjs::JSMemoryUsage = unsafe { std::mem::zeroed() };
        unsafe { qjs::JS_ComputeMemoryUsage(self.raw, &mut usage) };
        usage.obj_count
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        self.hooks.borrow_mut().clear();
        unsafe { qjs::JS_RunGC(self.raw) };
        let pending = raw::truthy(unsafe { qjs::JS_IsJobPending(self.raw) });
        let leaked = self.live_objects();
        if !pending && leaked > 0 {
            // Values that outlived the runtime still reference these.
            warn!(objects = leaked, "runtime dropped with live objects; leaking it");
        } else {
            unsafe { qjs::JS_FreeRuntime(self.raw) };
        }
        self.link.0.set(ptr::null_mut());
        debug!("runtime dropped");
    }
}

/// A runtime shared by one or more [`Context`]s. Cheap to clone.
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_options(RuntimeOptions::default())
    }

    pub fn with_options(options: RuntimeOptions) -> Self {
        let raw = unsafe { qjs::JS_NewRuntime() };
        if raw.is_null() {
            raw::out_of_memory();
        }
        let inner = Rc::new(RuntimeInner {
            raw,
            link: Rc::new(RuntimeLink(Cell::new(raw))),
            function_class: options.registry.class_id::<Descriptor>(),
            registry: options.registry.clone(),
            contexts: RefCell::new(FxHashMap::default()),
            hooks: RefCell::new(FxHashMap::default()),
            exotic_tables: RefCell::new(Vec::new()),
        });
        let threshold = match options.gc_threshold {
            0 => usize::MAX,
            threshold => threshold,
        };
        unsafe {
            qjs::JS_SetRuntimeOpaque(raw, Rc::as_ptr(&inner) as *mut c_void);
            qjs::JS_SetGCThreshold(raw, threshold as _);
            qjs::JS_SetMaxStackSize(raw, options.max_stack_size as _);
            if let Some(limit) = options.memory_limit {
                qjs::JS_SetMemoryLimit(raw, limit as _);
            }
            qjs::JS_SetModuleLoaderFunc(raw, None, Some(loader::load_module), ptr::null_mut());
            qjs::JS_SetHostPromiseRejectionTracker(raw, Some(track_rejection), ptr::null_mut());
        }
        let runtime = Self { inner };
        if let Err(err) = class::install::<Descriptor>(&runtime, "NativeFunction", Hooks::default()) {
            warn!(%err, "could not install the native function class");
        }
        debug!(?options, "runtime created");
        runtime
    }

    pub fn raw(&self) -> *mut qjs::JSRuntime {
        self.inner.raw
    }

    pub(crate) fn inner(&self) -> &RuntimeInner {
        &self.inner
    }

    pub(crate) fn link(&self) -> Rc<RuntimeLink> {
        self.inner.link.clone()
    }

    /// Class of the objects holding native function descriptors.
    pub(crate) fn function_class(&self) -> ClassId {
        self.inner.function_class
    }

    pub fn registry(&self) -> &Arc<ClassRegistry> {
        &self.inner.registry
    }

    pub fn ptr_eq(&self, other: &Runtime) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_job_pending(&self) -> bool {
        raw::truthy(unsafe { qjs::JS_IsJobPending(self.inner.raw) })
    }

    /// Run the oldest pending job.
    ///
    /// Returns the context the job ran in, or `None` when the queue is
    /// empty. A job that threw fails with the exception left pending in
    /// its context.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn execute_pending_job(&self) -> Result<Option<Context>> {
        loop {
            let mut job_ctx = ptr::null_mut();
            let status = unsafe { qjs::JS_ExecutePendingJob(self.inner.raw, &mut job_ctx) };
            if status == 0 {
                return Ok(None);
            }
            // The job's context may already be gone; only the table is
            // consulted, never the pointer itself.
            let ctx = if job_ctx.is_null() {
                None
            } else {
                self.inner.context(job_ctx).and_then(|inner| Context::upgrade(&inner))
            };
            match (status > 0, ctx) {
                (true, Some(ctx)) => return Ok(Some(ctx)),
                (true, None) => trace!("job ran in a context without bindings"),
                (false, Some(ctx)) => return Err(Exception::new(&ctx).into()),
                (false, None) => {
                    return Err(Error::RuntimeOperationFailed(
                        "a job failed in a context that no longer exists".into(),
                    ));
                }
            }
        }
    }

    /// Run jobs until none are pending. Returns how many ran.
    pub fn run_pending_jobs(&self) -> Result<usize> {
        let mut count = 0;
        while self.execute_pending_job()?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    /// Collect reference cycles. Returns the number of objects freed.
    pub fn run_gc(&self) -> usize {
        let before = self.inner.live_objects();
        unsafe { qjs::JS_RunGC(self.inner.raw) };
        usize::try_from(before - self.inner.live_objects()).unwrap_or(0)
    }

    /// Objects currently allocated in the runtime.
    pub fn live_objects(&self) -> usize {
        usize::try_from(self.inner.live_objects()).unwrap_or(0)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("live_objects", &self.live_objects())
            .field("contexts", &self.inner.contexts.borrow().len())
            .finish_non_exhaustive()
    }
}

unsafe extern "C" fn track_rejection(
    ctx: *mut qjs::JSContext,
    _promise: qjs::JSValue,
    reason: qjs::JSValue,
    is_handled: std::os::raw::c_int,
    _opaque: *mut c_void,
) {
    if raw::truthy(is_handled) {
        return;
    }
    let Some(ctx) = (unsafe { Context::from_raw(ctx) }) else {
        return;
    };
    let Some(callback) = ctx.rejection_callback() else {
        return;
    };
    let reason = Value::borrowed(&ctx, reason);
    if panic::catch_unwind(AssertUnwindSafe(|| callback(reason))).is_err() {
        warn!("unhandled rejection callback panicked");
    }
}
