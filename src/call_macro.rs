//! Call syntax helpers.
//!
//! ```rust,no_run
//! use pybridge::call;
//!
//! let module = pybridge::load("worker.py")?;
//! module.start(None)?;
//! let sum = call!(module, add(2, 3))?;
//! let same = module.call_with("add", (2, 3))?;
//! # Ok::<(), pybridge::BridgeError>(())
//! ```

use serde::Serialize;
use serde_json::Value;

/// Types usable as a positional argument of a remote call.
pub trait ToJsonArg {
    fn to_json(self) -> Value;
}

impl ToJsonArg for Value {
    fn to_json(self) -> Value {
        self
    }
}

macro_rules! impl_to_json_arg {
    ($($t:ty),* $(,)?) => {
        $(
            impl ToJsonArg for $t {
                fn to_json(self) -> Value {
                    Value::from(self)
                }
            }
        )*
    };
}

impl_to_json_arg!(i64, i32, i16, i8, u64, u32, u16, u8, f64, f32, bool, String);

impl ToJsonArg for &str {
    fn to_json(self) -> Value {
        Value::String(self.to_string())
    }
}

impl ToJsonArg for &String {
    fn to_json(self) -> Value {
        Value::String(self.clone())
    }
}

impl ToJsonArg for &Value {
    fn to_json(self) -> Value {
        self.clone()
    }
}

impl<T: Serialize> ToJsonArg for Vec<T> {
    fn to_json(self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl<T: Serialize> ToJsonArg for Option<T> {
    fn to_json(self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Call `$module.call("name", args)` with the arguments converted via
/// [`ToJsonArg`]:
///
/// ```rust,ignore
/// let sum = call!(module, add(2, 3))?;
/// let greeting = call!(module, echo("hi"))?;
/// ```
#[macro_export]
macro_rules! call {
    ($module:expr, $func:ident($($arg:expr),* $(,)?)) => {
        $module.call(
            stringify!($func),
            vec![$($crate::call_macro::ToJsonArg::to_json($arg)),*],
        )
    };
}

/// Tuples of arguments for [`ModuleHandle::call_with`](crate::ModuleHandle::call_with).
pub trait CallArgs {
    fn to_json_args(self) -> Vec<Value>;
}

impl CallArgs for () {
    fn to_json_args(self) -> Vec<Value> {
        vec![]
    }
}

impl CallArgs for Vec<Value> {
    fn to_json_args(self) -> Vec<Value> {
        self
    }
}

macro_rules! impl_call_args {
    ($(($($name:ident . $idx:tt),+)),* $(,)?) => {
        $(
            impl<$($name: ToJsonArg),+> CallArgs for ($($name,)+) {
                fn to_json_args(self) -> Vec<Value> {
                    vec![$(self.$idx.to_json()),+]
                }
            }
        )*
    };
}

impl_call_args!(
    (A.0),
    (A.0, B.1),
    (A.0, B.1, C.2),
    (A.0, B.1, C.2, D.3),
    (A.0, B.1, C.2, D.3, E.4),
    (A.0, B.1, C.2, D.3, E.4, F.5),
);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Recorder;

    impl Recorder {
        fn call(&self, name: &str, args: Vec<Value>) -> (String, Vec<Value>) {
            (name.to_string(), args)
        }
    }

    #[test]
    fn test_to_json_arg_primitives() {
        assert_eq!(5i64.to_json(), json!(5));
        assert_eq!(true.to_json(), json!(true));
        assert_eq!("hello".to_json(), json!("hello"));
        assert_eq!(2.5f64.to_json(), json!(2.5));
        assert_eq!(None::<i32>.to_json(), Value::Null);
        assert_eq!(vec![1, 2].to_json(), json!([1, 2]));
    }

    #[test]
    fn test_call_args_tuples() {
        assert_eq!(().to_json_args(), Vec::<Value>::new());
        assert_eq!((1i64,).to_json_args(), vec![json!(1)]);
        assert_eq!((2i64, "x").to_json_args(), vec![json!(2), json!("x")]);
        assert_eq!(
            (1u8, 2u16, 3u32, 4u64, 5i8, 6i16).to_json_args(),
            vec![json!(1), json!(2), json!(3), json!(4), json!(5), json!(6)]
        );
    }

    #[test]
    fn test_call_macro_expansion() {
        let recorder = Recorder;
        let (name, args) = call!(recorder, add(2i64, 3i64));
        assert_eq!(name, "add");
        assert_eq!(args, vec![json!(2), json!(3)]);

        let (name, args) = call!(recorder, ping());
        assert_eq!(name, "ping");
        assert!(args.is_empty());
    }
}
