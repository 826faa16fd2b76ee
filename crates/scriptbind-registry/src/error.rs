//! Registry error types.

use crate::class_id::ClassId;
use thiserror::Error;

/// Errors raised while recording inheritance edges.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A class was declared as its own base.
    #[error("class '{0}' cannot derive from itself")]
    SelfDerivation(&'static str),

    /// The edge would make a class its own ancestor.
    #[error("deriving '{derived}' from '{base}' would create an inheritance cycle")]
    Cycle {
        derived: &'static str,
        base: &'static str,
    },
}

/// Errors raised when recovering a typed pointer from an object payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CastError {
    /// The object's class is neither the expected class nor derived from it.
    #[error("Expected type {expected}, got object with class ID {actual}")]
    Unrelated { expected: &'static str, actual: ClassId },

    /// The payload is missing, of the wrong shape, or points to a dropped
    /// instance.
    #[error("Object's opaque pointer is null")]
    Null,
}
