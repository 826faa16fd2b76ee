//! Native bindings for an embedded script runtime.
//!
//! `scriptbind` converts between Rust values and runtime values, wraps Rust
//! callables as runtime functions and exposes Rust types as runtime classes
//! whose instances are shared between both sides.
//!
//! - [`FromScript`] / [`ToScript`]: conversions for primitives, text,
//!   sequences, maps, pairs, options, callables and bound instances
//! - [`Function`]: any `Fn` of up to eight convertible parameters
//! - [`ClassBuilder`]: constructors, methods, properties, inheritance and
//!   collector marks for a native type
//! - [`Module`]: native modules importable from scripts
//! - [`Error`]: native failures, and runtime exceptions surfaced in Rust
//!
//! # Example
//!
//! ```
//! use scriptbind::{Context, EvalFlags, Runtime};
//!
//! let rt = Runtime::new();
//! let ctx = Context::new(&rt);
//! ctx.global().set_function("greet", |name: String| format!("hello, {name}"))?;
//!
//! let greeting = ctx.eval("greet('world')", "<example>", EvalFlags::TYPE_GLOBAL)?;
//! assert_eq!(greeting.to::<String>()?, "hello, world");
//!
//! let failed = ctx.eval("greet()", "<example>", EvalFlags::TYPE_GLOBAL);
//! assert!(failed.is_err());
//! # Ok::<(), scriptbind::Error>(())
//! ```

mod class;
mod context;
mod convert;
mod error;
mod function;
mod loader;
mod module;
mod property;
mod raw;
mod runtime;
mod value;

pub use class::{ClassBuilder, ExoticMethods, PropertyName};
pub use context::{Context, EvalFlags};
pub use convert::{Entries, FromScript, Func, IntoArgs, Rest, ToScript};
pub use error::{Error, Exception, Result};
pub use function::{Function, IntoNativeFn};
pub use loader::{ModuleData, ModuleLoader, default_loader, to_uri};
pub use module::Module;
pub use property::{Atom, PropertyKey};
pub use runtime::{DEFAULT_GC_THRESHOLD, DEFAULT_MAX_STACK_SIZE, Runtime, RuntimeOptions};
pub use value::{PromiseState, Value};

pub use rquickjs::qjs;
pub use scriptbind_registry::{BoundPtr, ClassId, ClassRegistry, Tracer};

#[doc(hidden)]
pub mod __private {
    pub use num_enum::TryFromPrimitive;
}
