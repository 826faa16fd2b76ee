//! Engine class identities.

use std::fmt;

use lazy_static::lazy_static;
use parking_lot::Mutex;
use rquickjs::qjs;

lazy_static! {
    // The engine hands out identities from an unsynchronized global counter.
    static ref ALLOCATION: Mutex<()> = Mutex::new(());
}

/// Identity of a native class.
///
/// Identities come from one process-wide counter, so an identity means the
/// same class in every runtime that installs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClassId(qjs::JSClassID);

impl ClassId {
    /// Allocate a fresh identity.
    pub fn allocate() -> Self {
        let _guard = ALLOCATION.lock();
        let mut id: qjs::JSClassID = 0;
        // SAFETY: only reads and bumps the engine's identity counter, which
        // the lock above serializes.
        unsafe { qjs::JS_NewClassID(&mut id) };
        ClassId(id)
    }

    pub fn raw(self) -> qjs::JSClassID {
        self.0
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
