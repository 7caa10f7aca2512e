//! The `console` object installed into every context.
//!
//! One formatted line per call on stderr, variadic arguments coerced to
//! strings and space-joined, with a per-level colour and prefix.
//! `time`/`timeEnd` are reserved no-ops at this layer.

use boa_engine::{
    Context, JsResult, JsValue, NativeFunction, js_string, object::ObjectInitializer,
};
use colored::Colorize;

#[derive(Clone, Copy)]
enum Level {
    Log,
    Info,
    Warn,
    Error,
    Debug,
}

/// Coerce every argument to a string and join with single spaces.
fn join_args(args: &[JsValue], context: &mut Context) -> JsResult<String> {
    let mut line = String::new();
    for (index, value) in args.iter().enumerate() {
        if index > 0 {
            line.push(' ');
        }
        line.push_str(&value.to_string(context)?.to_std_string_escaped());
    }
    Ok(line)
}

fn print(args: &[JsValue], level: Level, context: &mut Context) -> JsResult<JsValue> {
    let line = join_args(args, context)?;
    match level {
        Level::Log => eprintln!("{line}"),
        Level::Info => eprintln!("INFO: {line}"),
        Level::Warn => eprintln!("{}", format!("WARN: {line}").yellow()),
        Level::Error => eprintln!("{}", format!("ERROR: {line}").red()),
        Level::Debug => eprintln!("{}", format!("DEBUG: {line}").blue()),
    }
    Ok(JsValue::undefined())
}

fn console_log(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    print(args, Level::Log, context)
}

fn console_info(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    print(args, Level::Info, context)
}

fn console_warn(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    print(args, Level::Warn, context)
}

fn console_error(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    print(args, Level::Error, context)
}

fn console_debug(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    print(args, Level::Debug, context)
}

fn console_noop(_this: &JsValue, _args: &[JsValue], _context: &mut Context) -> JsResult<JsValue> {
    Ok(JsValue::undefined())
}

pub(crate) fn install_console(context: &mut Context) -> JsResult<()> {
    let console = ObjectInitializer::new(context)
        .function(NativeFunction::from_fn_ptr(console_log), js_string!("log"), 1)
        .function(
            NativeFunction::from_fn_ptr(console_info),
            js_string!("info"),
            1,
        )
        .function(
            NativeFunction::from_fn_ptr(console_warn),
            js_string!("warn"),
            1,
        )
        .function(
            NativeFunction::from_fn_ptr(console_error),
            js_string!("error"),
            1,
        )
        .function(
            NativeFunction::from_fn_ptr(console_debug),
            js_string!("debug"),
            1,
        )
        .function(
            NativeFunction::from_fn_ptr(console_noop),
            js_string!("time"),
            1,
        )
        .function(
            NativeFunction::from_fn_ptr(console_noop),
            js_string!("timeEnd"),
            1,
        )
        .build();
    context
        .global_object()
        .set(js_string!("console"), console, false, context)?;
    Ok(())
}
