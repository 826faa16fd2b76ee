//! Payload stored in the opaque slot of bound objects.

use std::fmt;
use std::rc::{Rc, Weak};

/// A native instance held by a runtime object.
///
/// `Shared` keeps the instance alive for as long as the object exists.
/// `Borrowed` never does: the object observes an instance owned elsewhere
/// and reads as null once that owner drops it.
pub enum BoundPtr<T: ?Sized> {
    Shared(Rc<T>),
    Borrowed(Weak<T>),
}

impl<T: ?Sized> BoundPtr<T> {
    /// A strong reference to the instance, if it is still alive.
    pub fn get(&self) -> Option<Rc<T>> {
        match self {
            BoundPtr::Shared(rc) => Some(rc.clone()),
            BoundPtr::Borrowed(weak) => weak.upgrade(),
        }
    }

    pub fn is_borrowed(&self) -> bool {
        matches!(self, BoundPtr::Borrowed(_))
    }
}

impl<T: ?Sized> Clone for BoundPtr<T> {
    fn clone(&self) -> Self {
        match self {
            BoundPtr::Shared(rc) => BoundPtr::Shared(rc.clone()),
            BoundPtr::Borrowed(weak) => BoundPtr::Borrowed(weak.clone()),
        }
    }
}

impl<T: ?Sized> fmt::Debug for BoundPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundPtr::Shared(rc) => write!(f, "Shared(strong={})", Rc::strong_count(rc)),
            BoundPtr::Borrowed(weak) => write!(f, "Borrowed(alive={})", weak.strong_count() > 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn borrowed_does_not_keep_instance_alive() {
        let owner = Rc::new(5);
        let bound = BoundPtr::Borrowed(Rc::downgrade(&owner));
        assert_eq!(bound.get().as_deref(), Some(&5));
        drop(owner);
        assert!(bound.get().is_none());
        assert!(bound.is_borrowed());
    }

    #[test]
    fn shared_keeps_instance_alive() {
        let owner = Rc::new(String::from("kept"));
        let bound = BoundPtr::Shared(owner.clone());
        drop(owner);
        assert_eq!(bound.get().as_deref().map(String::as_str), Some("kept"));
    }
}
