//! Boa binding for the capability ledger: installs the instrumented globals.

use boa_engine::object::{FunctionObjectBuilder, ObjectInitializer};
use boa_engine::property::{Attribute, PropertyDescriptor};
use boa_engine::{Context, JsArgs, JsNativeError, JsObject, JsResult, JsString, JsValue, NativeFunction};

use crate::capabilities::{lock, Inert, Intercept, SharedLedger};

const BLOCKED_STATUS_TEXT: &str = "Forbidden - Network access blocked in sandbox";
const BLOCKED_BODY: &str = "Network access blocked";

pub(crate) fn install(context: &mut Context, ledger: &SharedLedger) -> JsResult<()> {
    register_network(context, ledger);
    register_document(context, ledger);
    register_storage(context, ledger, "localStorage");
    register_storage(context, ledger, "sessionStorage");
    register_timers(context, ledger);
    register_codecs(context, ledger);
    register_dynamic_code(context, ledger)?;
    register_console(context, ledger);

    let global = context.global_object();
    let _ = context.register_global_property(JsString::from("window"), global, Attribute::all());
    Ok(())
}

/// Builds a stand-in that translates its arguments, asks the ledger, and
/// converts the answer back into a script value.
fn intercepting<F>(ledger: &SharedLedger, translate: F) -> NativeFunction
where
    F: Fn(&JsValue, &[JsValue], &mut Context) -> JsResult<Intercept> + 'static,
{
    let ledger = ledger.clone();
    // SAFETY: the closure captures no garbage-collected values.
    unsafe {
        NativeFunction::from_closure(move |this, args, ctx| {
            let call = translate(this, args, ctx)?;
            let inert = lock(&ledger).intercept(call);
            to_js(inert, &ledger, ctx)
        })
    }
}

fn no_op(value: fn() -> JsValue) -> NativeFunction {
    NativeFunction::from_copy_closure(move |_this, _args, _ctx| Ok(value()))
}

fn to_js(inert: Inert, ledger: &SharedLedger, ctx: &mut Context) -> JsResult<JsValue> {
    match inert {
        Inert::Undefined => Ok(JsValue::undefined()),
        Inert::Null => Ok(JsValue::null()),
        Inert::Bool(b) => Ok(JsValue::from(b)),
        Inert::Number(n) => Ok(JsValue::from(n)),
        Inert::Text(text) => Ok(JsValue::from(JsString::from(text))),
        Inert::TimerId(id) => Ok(JsValue::from(id)),
        Inert::BlockedResponse => {
            let response = blocked_response(ctx);
            resolved(JsValue::from(response), ctx)
        }
        Inert::Node { tag } => Ok(JsValue::from(inert_node(ctx, ledger, &tag))),
        Inert::Rejected { message } => Err(JsNativeError::eval().with_message(message).into()),
        Inert::Error { message } => Err(JsNativeError::error().with_message(message).into()),
    }
}

fn text_arg(args: &[JsValue], index: usize, ctx: &mut Context) -> JsResult<String> {
    Ok(args.get_or_undefined(index).to_string(ctx)?.to_std_string_escaped())
}

fn number_arg(args: &[JsValue], index: usize, ctx: &mut Context) -> JsResult<f64> {
    let value = args.get_or_undefined(index);
    if value.is_undefined() {
        return Ok(0.0);
    }
    let n = value.to_number(ctx)?;
    Ok(if n.is_nan() { 0.0 } else { n })
}

fn display(value: &JsValue, ctx: &mut Context) -> String {
    value
        .to_string(ctx)
        .map(|s| s.to_std_string_escaped())
        .unwrap_or_else(|_| "<unprintable>".to_string())
}

/// `Promise.resolve(value)` through the realm's Promise constructor.
fn resolved(value: JsValue, ctx: &mut Context) -> JsResult<JsValue> {
    let promise = ctx.global_object().get(JsString::from("Promise"), ctx)?;
    let Some(constructor) = promise.as_object() else {
        return Ok(value);
    };
    let resolve = constructor.get(JsString::from("resolve"), ctx)?;
    match resolve.as_callable() {
        Some(resolve) => resolve.call(&promise, &[value], ctx),
        None => Ok(value),
    }
}

fn blocked_response(ctx: &mut Context) -> JsObject {
    let json = NativeFunction::from_fn_ptr(|_this, _args, ctx| {
        let body = ObjectInitializer::new(ctx)
            .property(JsString::from("error"), JsString::from(BLOCKED_BODY), Attribute::all())
            .build();
        resolved(JsValue::from(body), ctx)
    });
    let text = NativeFunction::from_fn_ptr(|_this, _args, ctx| {
        resolved(JsValue::from(JsString::from(BLOCKED_BODY)), ctx)
    });
    ObjectInitializer::new(ctx)
        .property(JsString::from("ok"), false, Attribute::all())
        .property(JsString::from("status"), 403, Attribute::all())
        .property(JsString::from("statusText"), JsString::from(BLOCKED_STATUS_TEXT), Attribute::all())
        .function(json, JsString::from("json"), 0)
        .function(text, JsString::from("text"), 0)
        .build()
}

fn register_network(context: &mut Context, ledger: &SharedLedger) {
    let fetch = intercepting(ledger, |_this, args, ctx| {
        let url = text_arg(args, 0, ctx)?;
        let options = args.get_or_undefined(1);
        let mut method = "GET".to_string();
        if let Some(options) = options.as_object() {
            let value = options.get(JsString::from("method"), ctx)?;
            if !value.is_undefined() {
                method = value.to_string(ctx)?.to_std_string_escaped().to_uppercase();
            }
        }
        Ok(Intercept::Network { api: "fetch()", url, method })
    });
    let _ = context.register_global_builtin_callable(JsString::from("fetch"), 1, fetch);

    let xhr_ledger = ledger.clone();
    // Constructing a request records nothing; open() records the call and
    // send() is blocked.
    // SAFETY: captures only the ledger handle.
    let xhr_ctor = unsafe {
        NativeFunction::from_closure(move |_this, _args, ctx| {
            let open = intercepting(&xhr_ledger, |_this, args, ctx| {
                let method = text_arg(args, 0, ctx)?.to_uppercase();
                let url = text_arg(args, 1, ctx)?;
                Ok(Intercept::Network { api: "XMLHttpRequest.open()", url, method })
            });
            let send = intercepting(&xhr_ledger, |_this, _args, _ctx| {
                Ok(Intercept::NetworkSend { api: "XMLHttpRequest" })
            });
            let request = ObjectInitializer::new(ctx)
                .function(open, JsString::from("open"), 2)
                .function(send, JsString::from("send"), 1)
                .function(no_op(JsValue::undefined), JsString::from("setRequestHeader"), 2)
                .function(no_op(JsValue::undefined), JsString::from("abort"), 0)
                .property(JsString::from("readyState"), 4, Attribute::all())
                .property(JsString::from("status"), 403, Attribute::all())
                .property(JsString::from("responseText"), JsString::from(BLOCKED_BODY), Attribute::all())
                .build();
            Ok(JsValue::from(request))
        })
    };
    let xhr = FunctionObjectBuilder::new(context.realm(), xhr_ctor)
        .name(JsString::from("XMLHttpRequest"))
        .length(0)
        .constructor(true)
        .build();
    let _ = context.register_global_property(JsString::from("XMLHttpRequest"), xhr, Attribute::all());

    let ws_ledger = ledger.clone();
    // SAFETY: captures only the ledger handle.
    let ws_ctor = unsafe {
        NativeFunction::from_closure(move |_this, args, ctx| {
            let url = text_arg(args, 0, ctx)?;
            let inert = lock(&ws_ledger).intercept(Intercept::Network {
                api: "new WebSocket()",
                url,
                method: "CONNECT".to_string(),
            });
            to_js(inert, &ws_ledger, ctx)?;
            let send = intercepting(&ws_ledger, |_this, _args, _ctx| {
                Ok(Intercept::NetworkSend { api: "WebSocket" })
            });
            let socket = ObjectInitializer::new(ctx)
                .function(send, JsString::from("send"), 1)
                .function(no_op(JsValue::undefined), JsString::from("close"), 0)
                .property(JsString::from("readyState"), 3, Attribute::all())
                .build();
            Ok(JsValue::from(socket))
        })
    };
    let ws = FunctionObjectBuilder::new(context.realm(), ws_ctor)
        .name(JsString::from("WebSocket"))
        .length(1)
        .constructor(true)
        .build();
    let _ = context.register_global_property(JsString::from("WebSocket"), ws, Attribute::all());

    let beacon = intercepting(ledger, |_this, args, ctx| {
        let url = text_arg(args, 0, ctx)?;
        Ok(Intercept::Network { api: "navigator.sendBeacon()", url, method: "POST".to_string() })
    });
    let navigator = ObjectInitializer::new(context)
        .function(beacon, JsString::from("sendBeacon"), 2)
        .property(
            JsString::from("userAgent"),
            JsString::from("Mozilla/5.0 (sandbox)"),
            Attribute::all(),
        )
        .property(JsString::from("language"), JsString::from("en-US"), Attribute::all())
        .build();
    let _ = context.register_global_property(JsString::from("navigator"), navigator, Attribute::all());
}

/// An element that records mutations and otherwise does nothing.
fn inert_node(ctx: &mut Context, ledger: &SharedLedger, tag: &str) -> JsObject {
    let target = tag.to_string();
    let append = intercepting(ledger, move |_this, _args, _ctx| {
        Ok(Intercept::DomAppend { api: "appendChild()", target: target.clone() })
    });
    let target = tag.to_string();
    let set_inner = intercepting(ledger, move |_this, args, ctx| {
        let content = text_arg(args, 0, ctx)?;
        Ok(Intercept::DomWrite { api: "element.innerHTML", target: target.clone(), content })
    });
    let set_inner = FunctionObjectBuilder::new(ctx.realm(), set_inner)
        .name(JsString::from("innerHTML"))
        .length(1)
        .constructor(false)
        .build();
    let get_inner = FunctionObjectBuilder::new(
        ctx.realm(),
        no_op(|| JsValue::from(JsString::from(""))),
    )
    .name(JsString::from("innerHTML"))
    .length(0)
    .constructor(false)
    .build();

    ObjectInitializer::new(ctx)
        .property(JsString::from("tagName"), JsString::from(tag.to_uppercase()), Attribute::all())
        .function(append, JsString::from("appendChild"), 1)
        .function(no_op(JsValue::undefined), JsString::from("removeChild"), 1)
        .function(no_op(JsValue::undefined), JsString::from("setAttribute"), 2)
        .function(no_op(JsValue::null), JsString::from("getAttribute"), 1)
        .accessor(JsString::from("innerHTML"), Some(get_inner), Some(set_inner), Attribute::all())
        .build()
}

fn register_document(context: &mut Context, ledger: &SharedLedger) {
    let get_cookie = intercepting(ledger, |_this, _args, _ctx| Ok(Intercept::CookieRead));
    let get_cookie = FunctionObjectBuilder::new(context.realm(), get_cookie)
        .name(JsString::from("cookie"))
        .length(0)
        .constructor(false)
        .build();
    let set_cookie = intercepting(ledger, |_this, args, ctx| {
        Ok(Intercept::CookieWrite { value: text_arg(args, 0, ctx)? })
    });
    let set_cookie = FunctionObjectBuilder::new(context.realm(), set_cookie)
        .name(JsString::from("cookie"))
        .length(1)
        .constructor(false)
        .build();

    let write = intercepting(ledger, |_this, args, ctx| {
        let content = args.iter().map(|arg| display(arg, ctx)).collect::<Vec<_>>().join("");
        Ok(Intercept::DomWrite { api: "document.write()", target: "document".into(), content })
    });
    let writeln = intercepting(ledger, |_this, args, ctx| {
        let mut content = args.iter().map(|arg| display(arg, ctx)).collect::<Vec<_>>().join("");
        content.push('\n');
        Ok(Intercept::DomWrite { api: "document.writeln()", target: "document".into(), content })
    });
    let create = intercepting(ledger, |_this, args, ctx| {
        Ok(Intercept::DomCreate { tag: text_arg(args, 0, ctx)?.to_lowercase() })
    });
    let body = inert_node(context, ledger, "body");

    let document = ObjectInitializer::new(context)
        .accessor(JsString::from("cookie"), Some(get_cookie), Some(set_cookie), Attribute::all())
        .function(write, JsString::from("write"), 1)
        .function(writeln, JsString::from("writeln"), 1)
        .function(create, JsString::from("createElement"), 1)
        .function(no_op(JsValue::null), JsString::from("getElementById"), 1)
        .function(no_op(JsValue::null), JsString::from("querySelector"), 1)
        .property(JsString::from("body"), body, Attribute::all())
        .build();
    let _ = context.register_global_property(JsString::from("document"), document, Attribute::all());
}

fn register_storage(context: &mut Context, ledger: &SharedLedger, area: &'static str) {
    let get = intercepting(ledger, move |_this, args, ctx| {
        Ok(Intercept::StorageRead { area, key: text_arg(args, 0, ctx)? })
    });
    let set = intercepting(ledger, move |_this, args, ctx| {
        let key = text_arg(args, 0, ctx)?;
        let value = text_arg(args, 1, ctx)?;
        Ok(Intercept::StorageWrite { area, key, value })
    });
    let remove = intercepting(ledger, move |_this, args, ctx| {
        Ok(Intercept::StorageRemove { area, key: text_arg(args, 0, ctx)? })
    });
    let clear = intercepting(ledger, move |_this, _args, _ctx| Ok(Intercept::StorageClear { area }));
    let storage = ObjectInitializer::new(context)
        .function(get, JsString::from("getItem"), 1)
        .function(set, JsString::from("setItem"), 2)
        .function(remove, JsString::from("removeItem"), 1)
        .function(clear, JsString::from("clear"), 0)
        .function(no_op(JsValue::null), JsString::from("key"), 1)
        .property(JsString::from("length"), 0, Attribute::all())
        .build();
    let _ = context.register_global_property(JsString::from(area), storage, Attribute::all());
}

fn register_timers(context: &mut Context, ledger: &SharedLedger) {
    for api in ["setTimeout", "setInterval"] {
        let schedule = intercepting(ledger, move |_this, args, ctx| {
            let string_callback = args.get_or_undefined(0).is_string();
            let delay_ms = number_arg(args, 1, ctx)?;
            Ok(Intercept::Timer { api, delay_ms, string_callback })
        });
        let _ = context.register_global_builtin_callable(JsString::from(api), 2, schedule);
    }
    for api in ["clearTimeout", "clearInterval"] {
        let clear = intercepting(ledger, move |_this, _args, _ctx| Ok(Intercept::TimerClear { api }));
        let _ = context.register_global_builtin_callable(JsString::from(api), 1, clear);
    }

    let now = intercepting(ledger, |_this, _args, _ctx| Ok(Intercept::Clock));
    let performance = ObjectInitializer::new(context)
        .function(now, JsString::from("now"), 0)
        .build();
    let _ = context.register_global_property(
        JsString::from("performance"),
        performance,
        Attribute::all(),
    );
}

fn register_codecs(context: &mut Context, ledger: &SharedLedger) {
    let atob = intercepting(ledger, |_this, args, ctx| {
        Ok(Intercept::Decode { data: text_arg(args, 0, ctx)? })
    });
    let btoa = intercepting(ledger, |_this, args, ctx| {
        Ok(Intercept::Encode { data: text_arg(args, 0, ctx)? })
    });
    let _ = context.register_global_builtin_callable(JsString::from("atob"), 1, atob);
    let _ = context.register_global_builtin_callable(JsString::from("btoa"), 1, btoa);
}

fn register_dynamic_code(context: &mut Context, ledger: &SharedLedger) -> JsResult<()> {
    let eval = intercepting(ledger, |_this, args, ctx| {
        Ok(Intercept::DynamicCode { primitive: "eval()", code: display(args.get_or_undefined(0), ctx) })
    });
    let _ = context.register_global_builtin_callable(JsString::from("eval"), 1, eval);

    let constructors = context.intrinsics().constructors();
    let function_prototype = constructors.function().prototype();
    let compiling = [
        ("AsyncFunction", "AsyncFunction constructor", constructors.async_function().prototype()),
        (
            "GeneratorFunction",
            "GeneratorFunction constructor",
            constructors.generator_function().prototype(),
        ),
        (
            "AsyncGeneratorFunction",
            "AsyncGeneratorFunction constructor",
            constructors.async_generator_function().prototype(),
        ),
    ];

    let function =
        rejecting_constructor(context, ledger, "Function", "Function constructor", function_prototype)?;
    let _ = context.register_global_property(JsString::from("Function"), function, Attribute::all());
    // Not globals, but reachable through `(async function () {}).constructor`.
    for (name, primitive, prototype) in compiling {
        rejecting_constructor(context, ledger, name, primitive, prototype)?;
    }
    Ok(())
}

/// A stand-in for a constructor that compiles source text. It shares the
/// intrinsic prototype, so `instanceof` and inherited methods behave as usual,
/// and the prototype's `constructor` points back at it.
fn rejecting_constructor(
    context: &mut Context,
    ledger: &SharedLedger,
    name: &'static str,
    primitive: &'static str,
    prototype: JsObject,
) -> JsResult<JsObject> {
    let compile = intercepting(ledger, move |_this, args, ctx| {
        let code = args.iter().map(|arg| display(arg, ctx)).collect::<Vec<_>>().join(", ");
        Ok(Intercept::DynamicCode { primitive, code })
    });
    let constructor: JsObject = FunctionObjectBuilder::new(context.realm(), compile)
        .name(JsString::from(name))
        .length(1)
        .constructor(true)
        .build()
        .into();
    constructor.define_property_or_throw(
        JsString::from("prototype"),
        PropertyDescriptor::builder()
            .value(prototype.clone())
            .writable(false)
            .enumerable(false)
            .configurable(false),
        context,
    )?;
    prototype.define_property_or_throw(
        JsString::from("constructor"),
        PropertyDescriptor::builder()
            .value(constructor.clone())
            .writable(true)
            .enumerable(false)
            .configurable(true),
        context,
    )?;
    Ok(constructor)
}

fn register_console(context: &mut Context, ledger: &SharedLedger) {
    let mut console = ObjectInitializer::new(context);
    for level in ["log", "info", "warn", "error", "debug"] {
        let print = intercepting(ledger, move |_this, args, ctx| {
            let args = args.iter().map(|arg| display(arg, ctx)).collect();
            Ok(Intercept::Console { level, args })
        });
        console.function(print, JsString::from(level), 0);
    }
    let console = console.build();
    let _ = context.register_global_property(JsString::from("console"), console, Attribute::all());
}
