//! Enum conversions through their primitive representation.

/// Implement [`FromScript`](crate::FromScript) and
/// [`ToScript`](crate::ToScript) for a fieldless enum deriving
/// `num_enum::IntoPrimitive` and `num_enum::TryFromPrimitive`.
///
/// Values travel as their discriminant. Unwrapping a number that names no
/// variant fails with [`Error::Range`](crate::Error::Range).
///
/// ```
/// use num_enum::{IntoPrimitive, TryFromPrimitive};
/// use scriptbind::{Context, Runtime, script_enum};
///
/// #[derive(Debug, Clone, Copy, PartialEq, IntoPrimitive, TryFromPrimitive)]
/// #[repr(u8)]
/// enum Level {
///     Low = 1,
///     High = 2,
/// }
///
/// script_enum!(Level: u8);
///
/// let rt = Runtime::new();
/// let ctx = Context::new(&rt);
/// let value = ctx.new_value(Level::High).unwrap();
/// assert_eq!(value.to::<u8>().unwrap(), 2);
/// assert_eq!(value.to::<Level>().unwrap(), Level::High);
/// ```
#[macro_export]
macro_rules! script_enum {
    ($ty:ty : $repr:ty) => {
        impl $crate::FromScript for $ty {
            fn from_script(ctx: &$crate::Context, value: $crate::qjs::JSValue) -> $crate::Result<Self> {
                let discriminant = <$repr as $crate::FromScript>::from_script(ctx, value)?;
                <$ty as $crate::__private::TryFromPrimitive>::try_from_primitive(discriminant).map_err(|_| {
                    $crate::Error::range(format!(
                        "{} is not a valid {}",
                        discriminant,
                        stringify!($ty)
                    ))
                })
            }
        }

        impl $crate::ToScript for $ty {
            fn to_script(self, ctx: &$crate::Context) -> $crate::Result<$crate::qjs::JSValue> {
                <$repr as $crate::ToScript>::to_script(<$repr>::from(self), ctx)
            }
        }
    };
}
