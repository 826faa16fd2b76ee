//! Native modules.
//!
//! A [`Module`] keeps an ordered table of exports. Each name is declared
//! with the engine when it is added; the values are handed to the engine
//! when the module is instantiated. After that, replacing an export updates
//! the live binding importers see, and new names can no longer be declared.

use std::cell::{Cell, RefCell};
use std::ffi::c_int;
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use rquickjs::qjs;
use tracing::debug;

use crate::class::ClassBuilder;
use crate::context::{Context, ContextInner};
use crate::convert::ToScript;
use crate::error::{Error, Exception, Result, boundary, check_status};
use crate::function::{Function, IntoNativeFn};
use crate::raw;
use crate::value::Value;

struct ModuleInner {
    name: String,
    def: *mut qjs::JSModuleDef,
    ctx: Weak<ContextInner>,
    exports: RefCell<IndexMap<String, Value>>,
    instantiated: Cell<bool>,
}

/// A native module importable from scripts. Cheap to clone.
#[derive(Clone)]
pub struct Module {
    inner: Rc<ModuleInner>,
}

impl Module {
    pub(crate) fn new(ctx: &Context, name: &str) -> Result<Module> {
        let cname = raw::cstring(name);
        let def = unsafe { qjs::JS_NewCModule(ctx.raw(), cname.as_ptr(), Some(init_module)) };
        if def.is_null() {
            return Err(Exception::new(ctx).into());
        }
        debug!(module = name, "native module added");
        Ok(Module {
            inner: Rc::new(ModuleInner {
                name: name.to_owned(),
                def,
                ctx: ctx.downgrade(),
                exports: RefCell::new(IndexMap::new()),
                instantiated: Cell::new(false),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn raw(&self) -> *mut qjs::JSModuleDef {
        self.inner.def
    }

    /// Whether a script has imported the module yet.
    pub fn is_instantiated(&self) -> bool {
        self.inner.instantiated.get()
    }

    fn context(&self) -> Result<Context> {
        Context::upgrade(&self.inner.ctx)
            .ok_or_else(|| Error::InternalInvariant(format!("module '{}' outlived its context", self.inner.name)))
    }

    /// Export `value` under `name`, replacing an earlier export of that
    /// name. Once the module has been instantiated the change is visible
    /// to importers immediately; new names must be added before that.
    pub fn add<V: ToScript>(&self, name: &str, value: V) -> Result<&Self> {
        let ctx = self.context()?;
        let value = ctx.new_value(value)?;
        let cname = raw::cstring(name);
        let declared = self.inner.exports.borrow().contains_key(name);
        if self.is_instantiated() {
            if !declared {
                return Err(Error::RuntimeOperationFailed(format!(
                    "module '{}' is already instantiated; cannot add export '{name}'",
                    self.inner.name
                )));
            }
            let live = value.clone().to_script(&ctx)?;
            check_status(&ctx, unsafe {
                qjs::JS_SetModuleExport(ctx.raw(), self.inner.def, cname.as_ptr(), live)
            })?;
        } else if !declared {
            check_status(&ctx, unsafe {
                qjs::JS_AddModuleExport(ctx.raw(), self.inner.def, cname.as_ptr())
            })?;
        }
        self.inner.exports.borrow_mut().insert(name.to_owned(), value);
        Ok(self)
    }

    /// Export a native function.
    pub fn function<F, Args, R>(&self, name: &str, f: F) -> Result<&Self>
    where
        F: IntoNativeFn<Args, R>,
        Args: 'static,
        R: ToScript + 'static,
    {
        self.add(name, Function::new(name, f))
    }

    /// Start registering class `T`; its constructors become exports.
    pub fn register_class<T: ?Sized + 'static>(&self, name: &str) -> Result<ClassBuilder<T>> {
        let ctx = self.context()?;
        ClassBuilder::new(&ctx, name, Some(self.clone()))
    }

    /// Names exported so far, in the order they were added.
    pub fn export_names(&self) -> Vec<String> {
        self.inner.exports.borrow().keys().cloned().collect()
    }

    /// The current value of an export.
    pub fn export(&self, name: &str) -> Option<Value> {
        self.inner.exports.borrow().get(name).cloned()
    }

    fn instantiate(&self, ctx: &Context) -> Result<()> {
        let exports: Vec<(String, Value)> = self
            .inner
            .exports
            .borrow()
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        debug!(module = %self.inner.name, exports = exports.len(), "instantiating native module");
        for (name, value) in exports {
            let cname = raw::cstring(&name);
            let value = value.to_script(ctx)?;
            check_status(ctx, unsafe {
                qjs::JS_SetModuleExport(ctx.raw(), self.inner.def, cname.as_ptr(), value)
            })?;
        }
        self.inner.instantiated.set(true);
        Ok(())
    }
}

unsafe extern "C" fn init_module(ctx: *mut qjs::JSContext, def: *mut qjs::JSModuleDef) -> c_int {
    let done = boundary(ctx, || {
        let context = Context::resolve(ctx)?;
        let module = context
            .module_by_def(def)
            .ok_or_else(|| Error::InternalInvariant("native module was dropped".into()))?;
        module.instantiate(&context)
    });
    match done {
        Some(()) => 0,
        None => -1,
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.inner.name)
            .field("exports", &self.export_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EvalFlags, Runtime};

    fn import_into_global(ctx: &Context, source: &str) {
        ctx.eval(source, "main.mjs", EvalFlags::TYPE_MODULE).unwrap();
        ctx.runtime().run_pending_jobs().unwrap();
    }

    #[test]
    fn exports_are_importable() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        let module = ctx.add_module("math").unwrap();
        module.add("pi", 3.5).unwrap().function("double", |x: i32| x * 2).unwrap();

        import_into_global(&ctx, "import { pi, double } from 'math'\nglobalThis.result = double(pi * 2)");
        assert_eq!(ctx.global().get_as::<i32, _>("result").unwrap(), 14);
        assert!(module.is_instantiated());
    }

    #[test]
    fn readding_replaces_in_place() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        let module = ctx.add_module("config").unwrap();
        module.add("a", 1).unwrap().add("b", 2).unwrap().add("a", 3).unwrap();
        assert_eq!(module.export_names(), vec!["a", "b"]);
        assert_eq!(module.export("a").unwrap().to::<i32>().unwrap(), 3);
    }

    #[test]
    fn later_exports_reach_instantiated_modules() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        let module = ctx.add_module("live").unwrap();
        module.add("n", 1).unwrap();
        import_into_global(&ctx, "import * as live from 'live'\nglobalThis.live = live");

        module.add("n", 2).unwrap();
        let current = ctx.eval("live.n", "<test>", EvalFlags::TYPE_GLOBAL).unwrap();
        assert_eq!(current.to::<i32>().unwrap(), 2);
    }

    #[test]
    fn new_names_need_an_uninstantiated_module() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        let module = ctx.add_module("closed").unwrap();
        module.add("n", 1).unwrap();
        import_into_global(&ctx, "import { n } from 'closed'");
        assert!(matches!(module.add("m", 2), Err(Error::RuntimeOperationFailed(_))));
        assert_eq!(module.export_names(), vec!["n"]);
    }
}
