//! Sequences, pairs and mappings.
//!
//! Sequences map to arrays. Mappings map to plain objects whose own
//! enumerable properties are the entries.

use std::collections::{BTreeMap, HashMap};
use std::hash::{BuildHasher, Hash};

use rquickjs::qjs;

use super::{FromScript, ToScript, take};
use crate::context::Context;
use crate::error::{Error, Result, check};
use crate::property::{self, OwnKeys, PropertyKey};
use crate::raw;

/// Length of an array-like object.
fn array_length(ctx: &Context, value: qjs::JSValue, expected: &str) -> Result<i64> {
    if !raw::is_object(value) {
        return Err(Error::type_mismatch(format!("{expected} expects an array")));
    }
    let length = property::get(ctx, value, "length")?;
    take(ctx, length)
}

fn new_array(ctx: &Context, items: impl IntoIterator<Item = Result<qjs::JSValue>>) -> Result<qjs::JSValue> {
    let array = check(ctx, unsafe { qjs::JS_NewArray(ctx.raw()) })?;
    for (index, item) in items.into_iter().enumerate() {
        let stored = item.and_then(|item| property::set(ctx, array, &index, item));
        if let Err(err) = stored {
            unsafe { qjs::JS_FreeValue(ctx.raw(), array) };
            return Err(err);
        }
    }
    Ok(array)
}

// =============================================================================
// Pairs
// =============================================================================

impl<U: FromScript, V: FromScript> FromScript for (U, V) {
    fn from_script(ctx: &Context, value: qjs::JSValue) -> Result<Self> {
        let length = array_length(ctx, value, "pair")?;
        if length != 2 {
            return Err(Error::type_mismatch(format!(
                "pair expects an array of length 2, got {length}"
            )));
        }
        let first = take(ctx, property::get(ctx, value, &0u32)?)?;
        let second = take(ctx, property::get(ctx, value, &1u32)?)?;
        Ok((first, second))
    }
}

impl<U: ToScript, V: ToScript> ToScript for (U, V) {
    fn to_script(self, ctx: &Context) -> Result<qjs::JSValue> {
        let (first, second) = self;
        let first = first.to_script(ctx)?;
        new_array(ctx, [Ok(first), second.to_script(ctx)])
    }
}

// =============================================================================
// Sequences
// =============================================================================

impl<T: FromScript> FromScript for Vec<T> {
    fn from_script(ctx: &Context, value: qjs::JSValue) -> Result<Self> {
        let length = array_length(ctx, value, "sequence")?;
        (0..length)
            .map(|index| take(ctx, property::get(ctx, value, &index)?))
            .collect()
    }
}

impl<T: ToScript> ToScript for Vec<T> {
    fn to_script(self, ctx: &Context) -> Result<qjs::JSValue> {
        new_array(ctx, self.into_iter().map(|item| item.to_script(ctx)))
    }
}

impl<T: ToScript + Clone> ToScript for &[T] {
    fn to_script(self, ctx: &Context) -> Result<qjs::JSValue> {
        new_array(ctx, self.iter().cloned().map(|item| item.to_script(ctx)))
    }
}

/// Trailing arguments of a bound function, converted element-wise.
///
/// Only valid as the last parameter:
///
/// ```compile_fail
/// use scriptbind::{Context, Function, Rest, Runtime};
///
/// let rt = Runtime::new();
/// let ctx = Context::new(&rt);
/// let f = Function::new("bad", |rest: Rest<i32>, last: i32| rest.0.len() as i32 + last);
/// ctx.new_value(f).unwrap();
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Rest<T>(pub Vec<T>);

impl<T: FromScript> FromScript for Rest<T> {
    const IS_REST: bool = true;

    /// Outside argument lists a rest parameter reads a whole array.
    fn from_script(ctx: &Context, value: qjs::JSValue) -> Result<Self> {
        Vec::from_script(ctx, value).map(Rest)
    }

    fn from_args(ctx: &Context, args: &[qjs::JSValue], index: usize, _expected: usize) -> Result<Self> {
        args.get(index..)
            .unwrap_or_default()
            .iter()
            .map(|&arg| T::from_script(ctx, arg))
            .collect::<Result<Vec<T>>>()
            .map(Rest)
    }
}

impl<T: ToScript> ToScript for Rest<T> {
    fn to_script(self, ctx: &Context) -> Result<qjs::JSValue> {
        self.0.to_script(ctx)
    }
}

// =============================================================================
// Mappings
// =============================================================================

/// Key-value pairs read from and written to an object's own properties, in
/// property order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Entries<K, V>(pub Vec<(K, V)>);

fn read_entries<K: FromScript, V: FromScript>(ctx: &Context, value: qjs::JSValue) -> Result<Vec<(K, V)>> {
    if !raw::is_object(value) {
        return Err(Error::type_mismatch("Value is not an object"));
    }
    let keys = OwnKeys::of(ctx, value)?;
    keys.atoms()
        .map(|atom| {
            let key = take(ctx, keys.key(atom)?)?;
            let item = take(ctx, keys.value(value, atom)?)?;
            Ok((key, item))
        })
        .collect()
}

fn write_entries<K: PropertyKey, V: ToScript>(ctx: &Context, entries: impl IntoIterator<Item = (K, V)>) -> Result<qjs::JSValue> {
    let object = check(ctx, unsafe { qjs::JS_NewObject(ctx.raw()) })?;
    for (key, item) in entries {
        let stored = item
            .to_script(ctx)
            .and_then(|item| property::set(ctx, object, &key, item));
        if let Err(err) = stored {
            unsafe { qjs::JS_FreeValue(ctx.raw(), object) };
            return Err(err);
        }
    }
    Ok(object)
}

impl<K: FromScript, V: FromScript> FromScript for Entries<K, V> {
    fn from_script(ctx: &Context, value: qjs::JSValue) -> Result<Self> {
        read_entries(ctx, value).map(Entries)
    }
}

impl<K: PropertyKey, V: ToScript> ToScript for Entries<K, V> {
    fn to_script(self, ctx: &Context) -> Result<qjs::JSValue> {
        write_entries(ctx, self.0)
    }
}

impl<K, V, S> FromScript for HashMap<K, V, S>
where
    K: FromScript + Eq + Hash,
    V: FromScript,
    S: BuildHasher + Default,
{
    fn from_script(ctx: &Context, value: qjs::JSValue) -> Result<Self> {
        read_entries(ctx, value).map(|entries| entries.into_iter().collect())
    }
}

impl<K: PropertyKey, V: ToScript, S> ToScript for HashMap<K, V, S> {
    fn to_script(self, ctx: &Context) -> Result<qjs::JSValue> {
        write_entries(ctx, self)
    }
}

impl<K: FromScript + Ord, V: FromScript> FromScript for BTreeMap<K, V> {
    fn from_script(ctx: &Context, value: qjs::JSValue) -> Result<Self> {
        read_entries(ctx, value).map(|entries| entries.into_iter().collect())
    }
}

impl<K: PropertyKey, V: ToScript> ToScript for BTreeMap<K, V> {
    fn to_script(self, ctx: &Context) -> Result<qjs::JSValue> {
        write_entries(ctx, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Runtime;
    use rustc_hash::FxHashMap;

    #[test]
    fn sequences_keep_order() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        for items in [vec![], vec![1], vec![3, 1, 2]] {
            let value = ctx.new_value(items.clone()).unwrap();
            assert!(value.is_array());
            assert_eq!(value.to::<Vec<i32>>().unwrap(), items);
        }
    }

    #[test]
    fn one_bad_element_fails_the_sequence() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        let value = ctx.new_value(vec![1, 2, 300]).unwrap();
        assert!(matches!(value.to::<Vec<u8>>(), Err(Error::Range(_))));
    }

    #[test]
    fn sequence_requires_an_array_like() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        let value = ctx.new_value(5).unwrap();
        let err = value.to::<Vec<i32>>().unwrap_err();
        assert_eq!(err.to_string(), "sequence expects an array");
    }

    #[test]
    fn pairs_need_exactly_two_elements() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        let pair = ctx.new_value(("left", 2)).unwrap();
        assert_eq!(pair.to::<(String, i32)>().unwrap(), ("left".to_owned(), 2));

        let triple = ctx.new_value(vec![1, 2, 3]).unwrap();
        let err = triple.to::<(i32, i32)>().unwrap_err();
        assert!(matches!(err, Error::TypeMismatch(_)));
        assert_eq!(err.to_string(), "pair expects an array of length 2, got 3");
    }

    #[test]
    fn mappings_use_own_properties() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        let mut map = BTreeMap::new();
        map.insert("a".to_owned(), 1);
        map.insert("b".to_owned(), 2);
        let value = ctx.new_value(map.clone()).unwrap();
        assert_eq!(value.to::<BTreeMap<String, i32>>().unwrap(), map);

        let empty: FxHashMap<String, i32> = ctx.new_value(FxHashMap::<String, i32>::default()).unwrap().to().unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn integer_keys_come_back_as_numbers() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        let entries = Entries(vec![(2u32, "two"), (1u32, "one")]);
        let value = ctx.new_value(entries).unwrap();
        let Entries(read) = value.to::<Entries<u32, String>>().unwrap();
        assert_eq!(read, vec![(1, "one".to_owned()), (2, "two".to_owned())]);
    }

    #[test]
    fn mapping_requires_an_object() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        let value = ctx.new_value("text").unwrap();
        let err = value.to::<HashMap<String, i32>>().unwrap_err();
        assert_eq!(err.to_string(), "Value is not an object");
    }
}
