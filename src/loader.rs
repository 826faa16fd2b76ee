//! Module loading.
//!
//! Imports of modules the engine does not know yet are resolved through the
//! context's loader. The default loader treats the specifier as a file path.

use std::ffi::{c_char, c_void};
use std::path::{Path, PathBuf};
use std::ptr;
use std::rc::Rc;

use rquickjs::qjs;
use tracing::debug;

use crate::context::{Context, EvalFlags};
use crate::error::{Exception, Result, boundary, check};
use crate::raw::{self, ErrorKind};
use crate::value::Value;

/// What a loader produced for a module specifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleData {
    /// Module source; `None` when the module does not exist.
    pub source: Option<String>,
    /// Value of `import.meta.url`.
    pub url: Option<String>,
}

impl ModuleData {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            url: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// A module that could not be found.
    pub fn missing() -> Self {
        Self::default()
    }
}

pub type ModuleLoader = Rc<dyn Fn(&str) -> Result<ModuleData>>;

/// Read the module from the file system.
///
/// A missing file is reported as a missing module; other I/O failures are
/// errors.
pub fn default_loader(name: &str) -> Result<ModuleData> {
    match std::fs::read_to_string(name) {
        Ok(source) => Ok(ModuleData::new(source).with_url(to_uri(name))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(ModuleData::missing()),
        Err(err) => Err(err.into()),
    }
}

/// Turn a module name into a URI.
///
/// Names that already carry a scheme are returned unchanged; anything else
/// is taken as a path and made absolute under `file://`.
pub fn to_uri(name: &str) -> String {
    if name.contains("://") {
        return name.to_owned();
    }
    let path = absolute(Path::new(name));
    let text = path.to_string_lossy().replace('\\', "/");
    if text.starts_with('/') {
        format!("file://{text}")
    } else {
        format!("file:///{text}")
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Set `url` (when known) and `main` on a module's `import.meta`.
pub(crate) fn set_import_meta(ctx: &Context, def: *mut qjs::JSModuleDef, url: Option<&str>, main: bool) -> Result<()> {
    let meta = Value::owned(ctx, check(ctx, unsafe { qjs::JS_GetImportMeta(ctx.raw(), def) })?);
    if let Some(url) = url {
        meta.set("url", url)?;
    }
    meta.set("main", main)?;
    Ok(())
}

/// Engine hook resolving a module the engine has not seen.
pub(crate) unsafe extern "C" fn load_module(
    ctx: *mut qjs::JSContext,
    name: *const c_char,
    _opaque: *mut c_void,
) -> *mut qjs::JSModuleDef {
    let name = unsafe { raw::from_cstr(name) };
    boundary(ctx, || {
        let context = Context::resolve(ctx)?;
        let loader = context.module_loader();
        debug!(module = %name, "loading module");
        let ModuleData { source, url } = loader(&name)?;
        let Some(source) = source else {
            raw::throw(ctx, ErrorKind::Reference, &format!("Could not load module filename '{name}'"));
            return Err(Exception::new(&context).into());
        };
        let compiled = context.eval(&source, &name, EvalFlags::TYPE_MODULE | EvalFlags::COMPILE_ONLY)?;
        // The engine keeps its own reference to the module definition.
        let def = unsafe { qjs::JS_VALUE_GET_PTR(compiled.raw()) } as *mut qjs::JSModuleDef;
        set_import_meta(&context, def, url.as_deref(), false)?;
        Ok(def)
    })
    .unwrap_or(ptr::null_mut())
}
