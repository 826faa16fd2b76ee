//! Native functions called from scripts, and script functions called from
//! native code.

use scriptbind::{Context, Error, EvalFlags, Func, Function, Rest, Result, Runtime, Value};

fn eval(ctx: &Context, source: &str) -> Result<Value> {
    ctx.eval(source, "<test>", EvalFlags::TYPE_GLOBAL)
}

fn thrown(result: Result<Value>) -> String {
    match result {
        Err(Error::Exception(exception)) => exception.message().unwrap_or_default(),
        other => panic!("expected a runtime exception, got {other:?}"),
    }
}

// =============================================================================
// Arguments
// =============================================================================

#[test]
fn test_two_required_parameters_called_with_one() {
    let rt = Runtime::new();
    let ctx = Context::new(&rt);
    ctx.global()
        .set_function("join2", |a: String, b: String| format!("{a}{b}"))
        .unwrap();
    assert_eq!(
        thrown(eval(&ctx, "join2('only')")),
        "TypeError: expected at least 2 arguments but received 1"
    );
    assert_eq!(eval(&ctx, "join2('a', 'b')").unwrap().to::<String>().unwrap(), "ab");
}

#[test]
fn test_extra_arguments_are_ignored() {
    let rt = Runtime::new();
    let ctx = Context::new(&rt);
    ctx.global().set_function("first", |a: i32| a).unwrap();
    assert_eq!(eval(&ctx, "first(1, 2, 3)").unwrap().to::<i32>().unwrap(), 1);
}

#[test]
fn test_rest_captures_trailing_arguments() {
    let rt = Runtime::new();
    let ctx = Context::new(&rt);
    ctx.global()
        .set_function("collect", |label: String, rest: Rest<String>| {
            let mut all = vec![label];
            all.extend(rest.0);
            all
        })
        .unwrap();

    let cases: [(&str, &[&str]); 3] = [
        ("collect('l')", &["l"]),
        ("collect('l', 'a')", &["l", "a"]),
        ("collect('l', 'a', 'b', 'c')", &["l", "a", "b", "c"]),
    ];
    for (call, expected) in cases {
        let got = eval(&ctx, call).unwrap().to::<Vec<String>>().unwrap();
        assert_eq!(got, expected, "{call}");
    }
}

#[test]
fn test_rest_elements_are_converted() {
    let rt = Runtime::new();
    let ctx = Context::new(&rt);
    ctx.global()
        .set_function("sum", |rest: Rest<i32>| rest.0.iter().sum::<i32>())
        .unwrap();
    assert_eq!(eval(&ctx, "sum()").unwrap().to::<i32>().unwrap(), 0);
    assert_eq!(eval(&ctx, "sum(1, 2, 3, 4)").unwrap().to::<i32>().unwrap(), 10);
    assert_eq!(
        thrown(eval(&ctx, "sum(1, 3000000000)")),
        "RangeError: Could not unwrap integer into i32"
    );
}

#[test]
fn test_optional_parameters() {
    let rt = Runtime::new();
    let ctx = Context::new(&rt);
    ctx.global()
        .set_function("greet", |name: Option<String>| {
            format!("hello {}", name.unwrap_or_else(|| "stranger".into()))
        })
        .unwrap();
    assert_eq!(eval(&ctx, "greet()").unwrap().to::<String>().unwrap(), "hello stranger");
    assert_eq!(eval(&ctx, "greet(null)").unwrap().to::<String>().unwrap(), "hello stranger");
    assert_eq!(eval(&ctx, "greet('ann')").unwrap().to::<String>().unwrap(), "hello ann");
}

// =============================================================================
// Exceptions
// =============================================================================

#[test]
fn test_out_of_range_argument_becomes_range_error() {
    let rt = Runtime::new();
    let ctx = Context::new(&rt);
    ctx.global().set_function("byte", |b: u8| b).unwrap();

    let result = eval(&ctx, "byte(256)");
    let Err(Error::Exception(exception)) = result else {
        panic!("expected the call to throw");
    };
    assert!(exception.context().unwrap().ptr_eq(&ctx));
    let value = exception.value().unwrap();
    assert!(value.is_error());
    assert_eq!(value.to_string(), "RangeError: Could not unwrap integer into u8");
    assert_eq!(value.get_as::<String, _>("message").unwrap(), "Could not unwrap integer into u8");
}

#[test]
fn test_script_can_catch_native_errors() {
    let rt = Runtime::new();
    let ctx = Context::new(&rt);
    ctx.global()
        .set_function("check", |n: i32| -> Result<i32> {
            if n < 0 {
                return Err(Error::range("negative"));
            }
            Ok(n)
        })
        .unwrap();
    let caught = eval(
        &ctx,
        "const p = new Promise(resolve => resolve(check(-1))); p.catch(e => e.message)",
    )
    .unwrap();
    rt.run_pending_jobs().unwrap();
    assert_eq!(caught.promise_result().unwrap().to::<String>().unwrap(), "negative");
}

#[test]
fn test_native_code_sees_script_exceptions() {
    let rt = Runtime::new();
    let ctx = Context::new(&rt);
    let fail = eval(&ctx, "() => { throw new TypeError('from script') }").unwrap();
    let Err(Error::Exception(exception)) = fail.call(()) else {
        panic!("expected the call to throw");
    };
    assert_eq!(exception.message().unwrap(), "TypeError: from script");
    assert!(ctx.get_exception().is_null());
}

// =============================================================================
// Callbacks
// =============================================================================

#[test]
fn test_script_callback_through_func() {
    let rt = Runtime::new();
    let ctx = Context::new(&rt);
    ctx.global()
        .set_function("apply", |f: Func<(i32,), i32>, x: i32| f.call((x,)))
        .unwrap();
    assert_eq!(eval(&ctx, "apply(n => n + 1, 41)").unwrap().to::<i32>().unwrap(), 42);
    assert_eq!(
        thrown(eval(&ctx, "apply(n => { throw new RangeError('inner') }, 1)")),
        "RangeError: inner"
    );
    assert_eq!(
        thrown(eval(&ctx, "apply(5, 1)")),
        "TypeError: expected a function, got number"
    );
}

#[test]
fn test_native_calls_script_function() {
    let rt = Runtime::new();
    let ctx = Context::new(&rt);
    let format: Func<(String, i32), String> = eval(&ctx, "(k, v) => k + '=' + v").unwrap().to().unwrap();
    assert_eq!(format.call(("width".into(), 80)).unwrap(), "width=80");
}

#[test]
fn test_functions_round_trip_through_values() {
    let rt = Runtime::new();
    let ctx = Context::new(&rt);
    let twice = ctx.new_value(Function::new("twice", |n: f64| n * 2.0)).unwrap();
    assert!(twice.is_function());
    assert_eq!(twice.call((1.25,)).unwrap().to::<f64>().unwrap(), 2.5);
    let as_func: Func<(f64,), f64> = twice.to().unwrap();
    assert_eq!(as_func.call((4.0,)).unwrap(), 8.0);
}
