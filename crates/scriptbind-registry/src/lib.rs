//! Scriptbind Registry crate.
//!
//! Process-wide bookkeeping for native classes exposed to the engine:
//! - Lazily allocated class identities, one per native type
//! - The derived-to-base inheritance graph and per-base cast tables
//! - GC mark lists for instances that embed runtime values

mod bound;
mod class_id;
mod error;
mod registry;
mod tracer;

pub use bound::BoundPtr;
pub use class_id::ClassId;
pub use error::{CastError, RegistryError};
pub use registry::{ClassRegistry, MarkFn};
pub use tracer::Tracer;
