//! Helpers over the engine's C interface.
//!
//! Everything here works on borrowed `JSValue`s and raw context pointers;
//! ownership is tracked by the callers.

use std::alloc::{Layout, handle_alloc_error};
use std::ffi::{CStr, CString, c_char, c_int};

use rquickjs::qjs;

pub(crate) fn tag(value: qjs::JSValue) -> i32 {
    unsafe { qjs::JS_VALUE_GET_NORM_TAG(value) }
}

/// Values with a negative tag point to reference counted engine memory.
pub(crate) fn has_ref_count(value: qjs::JSValue) -> bool {
    tag(value) < 0
}

pub(crate) fn is_exception(value: qjs::JSValue) -> bool {
    tag(value) == qjs::JS_TAG_EXCEPTION
}

pub(crate) fn is_null(value: qjs::JSValue) -> bool {
    tag(value) == qjs::JS_TAG_NULL
}

pub(crate) fn is_undefined(value: qjs::JSValue) -> bool {
    tag(value) == qjs::JS_TAG_UNDEFINED
}

pub(crate) fn is_object(value: qjs::JSValue) -> bool {
    tag(value) == qjs::JS_TAG_OBJECT
}

pub(crate) fn is_string(value: qjs::JSValue) -> bool {
    tag(value) == qjs::JS_TAG_STRING
}

pub(crate) fn is_number(value: qjs::JSValue) -> bool {
    matches!(tag(value), qjs::JS_TAG_INT | qjs::JS_TAG_FLOAT64)
}

pub(crate) fn is_module(value: qjs::JSValue) -> bool {
    tag(value) == qjs::JS_TAG_MODULE
}

/// `typeof` for everything that can be decided from the tag alone.
/// Objects read as "object"; callers that hold a context refine that.
pub(crate) fn tag_name(value: qjs::JSValue) -> &'static str {
    match tag(value) {
        qjs::JS_TAG_UNDEFINED | qjs::JS_TAG_UNINITIALIZED => "undefined",
        qjs::JS_TAG_NULL | qjs::JS_TAG_OBJECT => "object",
        qjs::JS_TAG_BOOL => "boolean",
        qjs::JS_TAG_INT | qjs::JS_TAG_FLOAT64 => "number",
        qjs::JS_TAG_STRING => "string",
        qjs::JS_TAG_SYMBOL => "symbol",
        qjs::JS_TAG_BIG_INT => "bigint",
        qjs::JS_TAG_MODULE => "module",
        qjs::JS_TAG_EXCEPTION => "exception",
        _ => "unknown",
    }
}

/// Name of a value for diagnostics, spelling out null.
pub(crate) fn describe(ctx: *mut qjs::JSContext, value: qjs::JSValue) -> &'static str {
    if is_null(value) {
        "null"
    } else {
        type_of(ctx, value)
    }
}

/// `typeof` of a value.
pub(crate) fn type_of(ctx: *mut qjs::JSContext, value: qjs::JSValue) -> &'static str {
    if is_object(value) && truthy(unsafe { qjs::JS_IsFunction(ctx, value) }) {
        "function"
    } else {
        tag_name(value)
    }
}

/// Engine booleans are C ints in some builds and Rust bools in others.
pub(crate) fn truthy(flag: impl Into<i64>) -> bool {
    flag.into() != 0
}

pub(crate) fn new_bool(value: bool) -> qjs::JSValue {
    if value { qjs::JS_TRUE } else { qjs::JS_FALSE }
}

/// Take a new reference without going through a context.
pub(crate) fn dup(value: qjs::JSValue) -> qjs::JSValue {
    if has_ref_count(value) {
        unsafe {
            let header = qjs::JS_VALUE_GET_PTR(value) as *mut qjs::JSRefCountHeader;
            (*header).ref_count += 1;
        }
    }
    value
}

/// Reference count of a heap value.
pub(crate) fn ref_count(value: qjs::JSValue) -> Option<i32> {
    if !has_ref_count(value) {
        return None;
    }
    let header = unsafe { qjs::JS_VALUE_GET_PTR(value) } as *const qjs::JSRefCountHeader;
    Some(unsafe { (*header).ref_count })
}

/// Same tag and the same payload or reference.
pub(crate) fn same_identity(a: qjs::JSValue, b: qjs::JSValue) -> bool {
    let kind = tag(a);
    if kind != tag(b) {
        return false;
    }
    unsafe {
        match kind {
            qjs::JS_TAG_INT | qjs::JS_TAG_BOOL => qjs::JS_VALUE_GET_INT(a) == qjs::JS_VALUE_GET_INT(b),
            qjs::JS_TAG_FLOAT64 => qjs::JS_VALUE_GET_FLOAT64(a).to_bits() == qjs::JS_VALUE_GET_FLOAT64(b).to_bits(),
            _ if kind < 0 => qjs::JS_VALUE_GET_PTR(a) == qjs::JS_VALUE_GET_PTR(b),
            _ => true,
        }
    }
}

/// A C string for the engine. Interior NUL bytes become spaces.
pub(crate) fn cstring(text: &str) -> CString {
    CString::new(text.replace('\0', " ")).unwrap_or_default()
}

/// NUL-terminated copy of source text; the engine reads one byte past the
/// end.
pub(crate) fn source_buffer(text: &str) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(text.len() + 1);
    buffer.extend_from_slice(text.as_bytes());
    buffer.push(0);
    buffer
}

/// Arguments of a native callback as a slice.
pub(crate) unsafe fn args<'a>(argc: c_int, argv: *mut qjs::JSValue) -> &'a [qjs::JSValue] {
    match usize::try_from(argc) {
        Ok(len) if len > 0 && !argv.is_null() => unsafe { std::slice::from_raw_parts(argv, len) },
        _ => &[],
    }
}

/// Runtime string coercion. `None` leaves the coercion's exception pending.
pub(crate) fn to_string(ctx: *mut qjs::JSContext, value: qjs::JSValue) -> Option<String> {
    let mut len: qjs::size_t = 0;
    let text = unsafe { qjs::JS_ToCStringLen2(ctx, &mut len, value, false.into()) };
    if text.is_null() {
        return None;
    }
    let bytes = unsafe { std::slice::from_raw_parts(text as *const u8, len as usize) };
    let owned = String::from_utf8_lossy(bytes).into_owned();
    unsafe { qjs::JS_FreeCString(ctx, text) };
    Some(owned)
}

/// Copy of an engine C string.
pub(crate) unsafe fn from_cstr(text: *const c_char) -> String {
    if text.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(text) }.to_string_lossy().into_owned()
}

/// Take the pending exception, if any.
pub(crate) fn take_exception(ctx: *mut qjs::JSContext) -> Option<qjs::JSValue> {
    let exception = unsafe { qjs::JS_GetException(ctx) };
    match tag(exception) {
        qjs::JS_TAG_NULL | qjs::JS_TAG_UNINITIALIZED => None,
        _ => Some(exception),
    }
}

/// Drop the pending exception, if any.
pub(crate) fn clear_exception(ctx: *mut qjs::JSContext) {
    if let Some(exception) = take_exception(ctx) {
        unsafe { qjs::JS_FreeValue(ctx, exception) };
    }
}

/// Error constructors the binding layer throws.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorKind {
    Type,
    Range,
    Reference,
    Internal,
}

/// Throw a new error object. Returns the exception sentinel.
pub(crate) fn throw(ctx: *mut qjs::JSContext, kind: ErrorKind, message: &str) -> qjs::JSValue {
    let message = cstring(message);
    let format = c"%s".as_ptr();
    unsafe {
        match kind {
            ErrorKind::Type => qjs::JS_ThrowTypeError(ctx, format, message.as_ptr()),
            ErrorKind::Range => qjs::JS_ThrowRangeError(ctx, format, message.as_ptr()),
            ErrorKind::Reference => qjs::JS_ThrowReferenceError(ctx, format, message.as_ptr()),
            ErrorKind::Internal => qjs::JS_ThrowInternalError(ctx, format, message.as_ptr()),
        }
    }
}

/// The engine could not allocate one of its root structures.
pub(crate) fn out_of_memory() -> ! {
    handle_alloc_error(Layout::new::<qjs::JSValue>())
}
