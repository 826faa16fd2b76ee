//! Handle passed to mark functions during cycle collection.

use std::marker::PhantomData;

use rquickjs::qjs;

/// Reports the runtime values a native instance holds to the collector.
///
/// Only exists while a class mark hook runs.
pub struct Tracer<'a> {
    rt: *mut qjs::JSRuntime,
    mark: qjs::JS_MarkFunc,
    _hook: PhantomData<&'a mut qjs::JSRuntime>,
}

impl Tracer<'_> {
    /// # Safety
    ///
    /// `rt` and `mark` must be the arguments of the class mark hook that
    /// is currently running, and the tracer must not outlive that call.
    pub unsafe fn new(rt: *mut qjs::JSRuntime, mark: qjs::JS_MarkFunc) -> Self {
        Self {
            rt,
            mark,
            _hook: PhantomData,
        }
    }

    /// The runtime being collected.
    pub fn runtime(&self) -> *mut qjs::JSRuntime {
        self.rt
    }

    /// Report one value.
    ///
    /// # Safety
    ///
    /// `value` must belong to the runtime being collected, and the object
    /// being marked must own a reference to it.
    pub unsafe fn mark(&mut self, value: qjs::JSValue) {
        unsafe { qjs::JS_MarkValue(self.rt, value, self.mark) }
    }
}
