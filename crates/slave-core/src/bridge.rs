//! Script-facing bridge (C4): the `sys`/`io`/`net`/`sync`/`mysql`/`redis`/
//! `console` globals a loaded script sees.
//!
//! Every function here is installed once, at `load()` time, as a closure
//! capturing the VM's [`VmContext`] by `Rc` handle — unlike the teacher's
//! `vm.rs`, which reinstalls its (much smaller) stdout/stderr hooks on every
//! call, because here the host objects are stable for the whole lifetime of
//! the VM rather than per-call state. The `build_writer_object`-style
//! "namespace module with native-function attributes" idiom is reused
//! directly from the teacher for each of these seven namespaces.

use std::collections::BTreeMap;
use std::rc::Rc;

use rustpython_vm::{function::FuncArgs, scope::Scope, AsObject, PyObjectRef, PyResult, TryFromObject, VirtualMachine};

use crate::codec::{json_to_value, value_to_json, Codec, JsonCodec};
use crate::transport::Dest;
use crate::types::Value;
use crate::vm::VmContext;

/// Install every bridge namespace into `scope.globals`.
pub(crate) fn install(vm: &VirtualMachine, scope: &Scope, ctx: Rc<VmContext>) {
    let globals = scope.globals.as_object();
    let _ = globals.set_item("sys", build_sys(vm), vm);
    let _ = globals.set_item("io", build_io(vm), vm);
    let _ = globals.set_item("net", build_net(vm, Rc::clone(&ctx)), vm);
    let _ = globals.set_item("sync", build_sync(vm, Rc::clone(&ctx)), vm);
    let _ = globals.set_item("mysql", build_mysql(vm, Rc::clone(&ctx)), vm);
    let _ = globals.set_item("redis", build_redis(vm, Rc::clone(&ctx)), vm);
    let _ = globals.set_item("console", build_console(vm, Rc::clone(&ctx)), vm);
    let _ = globals.set_item("CurrentSessionId", vm.ctx.new_int(0).into(), vm);
}

fn namespace(vm: &VirtualMachine, name: &str, attrs: Vec<(&str, PyObjectRef)>) -> PyObjectRef {
    let ns = vm.new_module(name, vm.ctx.new_dict(), None);
    for (attr, value) in attrs {
        let _ = ns.set_attr(attr, value, vm);
    }
    ns.into()
}

fn arg_str(args: &FuncArgs, idx: usize, vm: &VirtualMachine) -> Option<String> {
    args.args.get(idx).and_then(|o| o.str(vm).ok()).map(|s| s.as_str().to_owned())
}

fn arg_u64(args: &FuncArgs, idx: usize, vm: &VirtualMachine) -> Option<u64> {
    args.args.get(idx).and_then(|o| u64::try_from_object(vm, o.clone()).ok())
}

fn arg_i64(args: &FuncArgs, idx: usize, vm: &VirtualMachine) -> Option<i64> {
    args.args.get(idx).and_then(|o| i64::try_from_object(vm, o.clone()).ok())
}

// ── Value <-> Python object marshalling ──────────────────────────────────────

/// Convert a native [`Value`] into a Python object, recursively.
pub(crate) fn value_to_py(vm: &VirtualMachine, value: &Value) -> PyObjectRef {
    match value {
        Value::Null => vm.ctx.none(),
        Value::Bool(b) => vm.ctx.new_bool(*b).into(),
        Value::Int(i) => vm.ctx.new_int(*i).into(),
        Value::Uint(u) => vm.ctx.new_int(*u).into(),
        Value::Float(f) => vm.ctx.new_float(*f).into(),
        Value::Bytes(b) => vm.ctx.new_bytes(b.clone()).into(),
        Value::Str(s) => vm.ctx.new_str(s.as_str()).into(),
        Value::Seq(seq) => {
            let items: Vec<PyObjectRef> = seq.iter().map(|v| value_to_py(vm, v)).collect();
            vm.ctx.new_list(items).into()
        }
        Value::Map(map) => value_map_to_py(vm, map),
    }
}

/// Convert an integer-keyed [`Value`] map into a Python dict keyed by the
/// stringified integer, per the marshalling rule in §4.2.
pub(crate) fn value_map_to_py(vm: &VirtualMachine, map: &BTreeMap<i64, Value>) -> PyObjectRef {
    let dict = vm.ctx.new_dict();
    for (k, v) in map {
        let _ = dict.set_item(k.to_string().as_str(), value_to_py(vm, v), vm);
    }
    dict.into()
}

/// Convert a Python object back into a native [`Value`], recursively.
pub(crate) fn py_to_value(vm: &VirtualMachine, obj: &PyObjectRef) -> Value {
    if vm.is_none(obj) {
        return Value::Null;
    }
    if let Ok(b) = bool::try_from_object(vm, obj.clone()) {
        if obj.class().is(vm.ctx.types.bool_type) {
            return Value::Bool(b);
        }
    }
    if let Ok(i) = i64::try_from_object(vm, obj.clone()) {
        if obj.class().is(vm.ctx.types.int_type) {
            return Value::Int(i);
        }
    }
    if let Ok(f) = f64::try_from_object(vm, obj.clone()) {
        if obj.class().is(vm.ctx.types.float_type) {
            return Value::Float(f);
        }
    }
    if let Some(bytes) = obj.payload::<rustpython_vm::builtins::PyBytes>() {
        return Value::Bytes(bytes.as_bytes().to_vec());
    }
    if let Ok(s) = obj.str(vm) {
        if obj.class().is(vm.ctx.types.str_type) {
            return Value::Str(s.as_str().to_owned());
        }
    }
    if vm.call_method(obj, "items", ()).is_ok() {
        // A dict-like: reconstruct the integer-keyed map.
        if let Ok(map) = py_dict_to_value_map(vm, obj) {
            return Value::Map(map);
        }
    }
    if let Ok(list) = Vec::<PyObjectRef>::try_from_object(vm, obj.clone()) {
        return Value::Seq(list.iter().map(|o| py_to_value(vm, o)).collect());
    }
    // Fall back to the repr so unmarshalled types are at least visible.
    Value::Str(obj.repr(vm).map(|s| s.as_str().to_owned()).unwrap_or_default())
}

/// Parse a Python dict's keys back into integers, dropping non-numeric keys —
/// the same lossy convention documented in §4.2/§9.
pub(crate) fn py_dict_to_value_map(vm: &VirtualMachine, obj: &PyObjectRef) -> PyResult<BTreeMap<i64, Value>> {
    let mut out = BTreeMap::new();
    let items = vm.call_method(obj, "items", ())?;
    let iter = vm.call_method(&items, "__iter__", ())?;
    loop {
        match vm.call_method(&iter, "__next__", ()) {
            Ok(pair) => {
                let tuple = Vec::<PyObjectRef>::try_from_object(vm, pair)?;
                if tuple.len() != 2 {
                    continue;
                }
                let key_str = tuple[0].str(vm)?.as_str().to_owned();
                if let Ok(key) = key_str.parse::<i64>() {
                    out.insert(key, py_to_value(vm, &tuple[1]));
                }
            }
            Err(_) => break,
        }
    }
    Ok(out)
}

// ── sys ───────────────────────────────────────────────────────────────────

fn build_sys(vm: &VirtualMachine) -> PyObjectRef {
    let version_fn = vm.new_function("version", |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
        Ok(vm.ctx.new_str(env!("CARGO_PKG_VERSION")).into())
    });
    let encode_fn = vm.new_function("encode", |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
        let Some(obj) = args.args.first() else { return Ok(vm.ctx.new_str("").into()) };
        let value = py_to_value(vm, obj);
        let json = value_to_json(&value);
        Ok(vm.ctx.new_str(json.to_string()).into())
    });
    let decode_fn = vm.new_function("decode", |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
        let Some(s) = arg_str(&args, 0, vm) else { return Ok(vm.ctx.none()) };
        match serde_json::from_str::<serde_json::Value>(&s) {
            Ok(json) => Ok(value_to_py(vm, &json_to_value(&json))),
            Err(_) => Ok(vm.ctx.none()),
        }
    });
    namespace(vm, "sys", vec![("version", version_fn), ("encode", encode_fn), ("decode", decode_fn)])
}

// ── io ────────────────────────────────────────────────────────────────────

fn build_io(vm: &VirtualMachine) -> PyObjectRef {
    let read_fn = vm.new_function("read", |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
        let Some(path) = arg_str(&args, 0, vm) else { return Ok(vm.ctx.none()) };
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(vm.ctx.new_str(content).into()),
            Err(e) => {
                tracing::warn!(path, error = %e, "io.read failed");
                Ok(vm.ctx.none())
            }
        }
    });
    let write_fn = vm.new_function("write", |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
        let (Some(path), Some(content)) = (arg_str(&args, 0, vm), arg_str(&args, 1, vm)) else {
            return Ok(vm.ctx.new_bool(false).into());
        };
        match std::fs::write(&path, content) {
            Ok(()) => Ok(vm.ctx.new_bool(true).into()),
            Err(e) => {
                tracing::warn!(path, error = %e, "io.write failed");
                Ok(vm.ctx.new_bool(false).into())
            }
        }
    });
    let exists_fn = vm.new_function("exists", |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
        let exists = arg_str(&args, 0, vm).map(|p| std::path::Path::new(&p).exists()).unwrap_or(false);
        Ok(vm.ctx.new_bool(exists).into())
    });
    let unlink_fn = vm.new_function("unlink", |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
        let ok = arg_str(&args, 0, vm).map(|p| std::fs::remove_file(p).is_ok()).unwrap_or(false);
        Ok(vm.ctx.new_bool(ok).into())
    });
    namespace(vm, "io", vec![("read", read_fn), ("write", write_fn), ("exists", exists_fn), ("unlink", unlink_fn)])
}

// ── net ───────────────────────────────────────────────────────────────────

fn build_net(vm: &VirtualMachine, ctx: Rc<VmContext>) -> PyObjectRef {
    let reply_ctx = Rc::clone(&ctx);
    let reply_fn = vm.new_function("reply", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
        let Some(obj) = args.args.first() else { return Ok(vm.ctx.new_bool(false).into()) };
        let Ok(body) = py_dict_to_value_map(vm, obj) else { return Ok(vm.ctx.new_bool(false).into()) };
        let session_id = reply_ctx.current_session_id.get();
        let source_id = reply_ctx.associated_source_id.get();
        let addr = reply_ctx.associated_source_addr.borrow().clone();
        let msg = crate::types::Message::new(crate::types::MessageType::Deliver)
            .with_tag(crate::types::Tag::Adapter)
            .with_scheme(crate::types::Scheme::S2C)
            .with_session_id(if session_id != 0 { vec![session_id] } else { vec![] })
            .with_body(body);
        let bytes = JsonCodec.encode(&msg).unwrap_or_default();
        let dest = crate::transport::reply_dest(source_id, &addr);
        let ok = reply_ctx.transport.send(dest, bytes).is_ok();
        Ok(vm.ctx.new_bool(ok).into())
    });

    let deliver_ctx = Rc::clone(&ctx);
    let deliver_fn = vm.new_function("deliver", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
        let Some(obj) = args.args.first() else { return Ok(vm.ctx.new_bool(false).into()) };
        let Ok(body) = py_dict_to_value_map(vm, obj) else { return Ok(vm.ctx.new_bool(false).into()) };
        let msg = crate::types::Message::new(crate::types::MessageType::Deliver)
            .with_tag(crate::types::Tag::Adapter)
            .with_scheme(crate::types::Scheme::S2S)
            .with_body(body);
        let bytes = JsonCodec.encode(&msg).unwrap_or_default();
        let ok = deliver_ctx.transport.send(Dest::Controller, bytes).is_ok();
        Ok(vm.ctx.new_bool(ok).into())
    });

    let kick_ctx = Rc::clone(&ctx);
    let kick_fn = vm.new_function("kick", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
        let Ok(ids) = Vec::<PyObjectRef>::try_from_object(vm, args.args.first().cloned().unwrap_or_else(|| vm.ctx.new_list(vec![]).into())) else {
            return Ok(vm.ctx.new_bool(false).into());
        };
        let session_ids: Vec<u64> = ids.iter().filter_map(|o| u64::try_from_object(vm, o.clone()).ok()).collect();
        let msg = crate::types::Message::new(crate::types::MessageType::KillClient)
            .with_tag(crate::types::Tag::Adapter)
            .with_scheme(crate::types::Scheme::S2S)
            .with_session_id(session_ids);
        let bytes = JsonCodec.encode(&msg).unwrap_or_default();
        let ok = kick_ctx.transport.send(Dest::Controller, bytes).is_ok();
        Ok(vm.ctx.new_bool(ok).into())
    });

    let test_fn = vm.new_function("test", |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
        Ok(vm.ctx.new_bool(true).into())
    });

    namespace(vm, "net", vec![("reply", reply_fn), ("deliver", deliver_fn), ("kick", kick_fn), ("test", test_fn)])
}

// ── sync (global locks) ──────────────────────────────────────────────────

fn build_sync(vm: &VirtualMachine, ctx: Rc<VmContext>) -> PyObjectRef {
    let init_ctx = Rc::clone(&ctx);
    let init_fn = vm.new_function("init", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
        let key = arg_u64(&args, 0, vm).unwrap_or_else(|| init_ctx.default_lock_key.get());
        Ok(vm.ctx.new_bool(init_ctx.storage.init_lock(key)).into())
    });

    let dispose_ctx = Rc::clone(&ctx);
    let dispose_fn = vm.new_function("dispose", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
        let key = arg_u64(&args, 0, vm).unwrap_or_else(|| dispose_ctx.default_lock_key.get());
        Ok(vm.ctx.new_bool(dispose_ctx.storage.dispose_lock(key)).into())
    });

    let lock_ctx = Rc::clone(&ctx);
    let lock_fn = vm.new_function("lock", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
        let key = arg_u64(&args, 0, vm).unwrap_or_else(|| lock_ctx.current_session_id.get());
        if key == 0 {
            return Ok(vm.ctx.new_int(0i64).into());
        }
        let serial = lock_ctx.storage.lock(key);
        if serial != 0 {
            lock_ctx.default_lock_key.set(key);
            lock_ctx.held_lock_serial.set(serial);
            crate::metrics::incr_locklogic();
        }
        Ok(vm.ctx.new_int(serial).into())
    });

    let unlock_ctx = Rc::clone(&ctx);
    let unlock_fn = vm.new_function("unlock", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
        let key = arg_u64(&args, 0, vm).unwrap_or_else(|| unlock_ctx.default_lock_key.get());
        let serial = arg_i64(&args, 1, vm).unwrap_or_else(|| unlock_ctx.held_lock_serial.get());
        if key == unlock_ctx.default_lock_key.get() && unlock_ctx.held_lock_serial.get() == 0 {
            return Ok(vm.ctx.new_int(-1i64).into());
        }
        let result = unlock_ctx.storage.unlock(key, serial);
        if key == unlock_ctx.default_lock_key.get() {
            unlock_ctx.held_lock_serial.set(0);
        }
        crate::metrics::incr_unlocklogic();
        Ok(vm.ctx.new_int(result).into())
    });

    namespace(vm, "sync", vec![("init", init_fn), ("dispose", dispose_fn), ("lock", lock_fn), ("unlock", unlock_fn)])
}

// ── mysql ─────────────────────────────────────────────────────────────────

fn build_mysql(vm: &VirtualMachine, ctx: Rc<VmContext>) -> PyObjectRef {
    let query_ctx = Rc::clone(&ctx);
    let query_fn = vm.new_function("query", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
        let Some(sql) = arg_str(&args, 0, vm) else { return Ok(vm.ctx.none()) };
        let extra_args: Vec<Value> = args.args.iter().skip(1).map(|o| py_to_value(vm, o)).collect();
        match query_ctx.storage.query(&sql, &extra_args) {
            Some(rows) => {
                let list: Vec<PyObjectRef> = rows
                    .into_iter()
                    .map(|row| {
                        let dict = vm.ctx.new_dict();
                        for (k, v) in row {
                            let _ = dict.set_item(k.as_str(), value_to_py(vm, &v), vm);
                        }
                        dict.into()
                    })
                    .collect();
                Ok(vm.ctx.new_list(list).into())
            }
            None => Ok(vm.ctx.none()),
        }
    });

    let exec_ctx = Rc::clone(&ctx);
    let exec_fn = vm.new_function("exec", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
        let Some(sql) = arg_str(&args, 0, vm) else { return Ok(vm.ctx.new_int(0i64).into()) };
        let extra_args: Vec<Value> = args.args.iter().skip(1).map(|o| py_to_value(vm, o)).collect();
        let affected = exec_ctx.storage.exec(&sql, &extra_args);
        Ok(vm.ctx.new_int(affected).into())
    });

    let transaction_fn = vm.new_function("transaction", |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
        // Unimplemented, matching the original's unwired transaction path.
        Ok(vm.ctx.new_bool(false).into())
    });

    namespace(vm, "mysql", vec![("query", query_fn), ("exec", exec_fn), ("transaction", transaction_fn)])
}

// ── redis ─────────────────────────────────────────────────────────────────

fn build_redis(vm: &VirtualMachine, ctx: Rc<VmContext>) -> PyObjectRef {
    let open_ctx = Rc::clone(&ctx);
    let open_fn = vm.new_function("open", move |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
        if open_ctx.redis_open.get() {
            return Ok(vm.ctx.new_bool(false).into());
        }
        let key = open_ctx.default_lock_key.get();
        open_ctx.redis_handle_key.set(key);
        open_ctx.redis_open.set(true);
        Ok(vm.ctx.new_bool(true).into())
    });

    let close_ctx = Rc::clone(&ctx);
    let close_fn = vm.new_function("close", move |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
        close_ctx.redis_open.set(false);
        close_ctx.redis_handle_key.set(0);
        Ok(vm.ctx.new_bool(true).into())
    });

    let cmd_ctx = Rc::clone(&ctx);
    let cmd_fn = vm.new_function("cmd", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
        redis_call(&cmd_ctx, &args, vm, true)
    });

    let todo_ctx = Rc::clone(&ctx);
    let todo_fn = vm.new_function("todo", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
        redis_call(&todo_ctx, &args, vm, false)
    });

    let send_ctx = Rc::clone(&ctx);
    let send_fn = vm.new_function("send", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
        if !send_ctx.redis_open.get() {
            tracing::warn!("redis.send called before open()");
            return Ok(vm.ctx.new_bool(false).into());
        }
        redis_call(&send_ctx, &args, vm, true)
    });

    let flush_ctx = Rc::clone(&ctx);
    let flush_fn = vm.new_function("flush", move |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
        Ok(vm.ctx.new_bool(flush_ctx.redis_open.get()).into())
    });

    let receive_ctx = Rc::clone(&ctx);
    let receive_fn = vm.new_function("receive", move |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
        if !receive_ctx.redis_open.get() {
            tracing::warn!("redis.receive called before open()");
            return Ok(vm.ctx.none());
        }
        Ok(vm.ctx.none())
    });

    namespace(
        vm,
        "redis",
        vec![
            ("open", open_fn),
            ("close", close_fn),
            ("cmd", cmd_fn),
            ("todo", todo_fn),
            ("send", send_fn),
            ("flush", flush_fn),
            ("receive", receive_fn),
        ],
    )
}

fn redis_call(ctx: &Rc<VmContext>, args: &FuncArgs, vm: &VirtualMachine, encode: bool) -> PyResult<PyObjectRef> {
    if !ctx.redis_open.get() {
        tracing::warn!("redis command issued before open()");
        return Ok(vm.ctx.none());
    }
    let Some(name) = arg_str(args, 0, vm) else { return Ok(vm.ctx.none()) };
    let extra_args: Vec<Value> = args
        .args
        .iter()
        .skip(1)
        .map(|o| {
            let v = py_to_value(vm, o);
            if encode {
                Value::Str(value_to_json(&v).to_string())
            } else {
                v
            }
        })
        .collect();
    let key = ctx.redis_handle_key.get();
    match ctx.storage.redis_cmd(key, &name, &extra_args) {
        Some(v) => Ok(value_to_py(vm, &v)),
        None => Ok(vm.ctx.none()),
    }
}

// ── console ───────────────────────────────────────────────────────────────

fn build_console(vm: &VirtualMachine, ctx: Rc<VmContext>) -> PyObjectRef {
    fn make(vm: &VirtualMachine, ctx: Rc<VmContext>, level: tracing::Level) -> PyObjectRef {
        vm.new_function("log", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let session_id = ctx.current_session_id.get();
            let rendered = format_printf(vm, &args.args);
            match level {
                tracing::Level::ERROR => tracing::error!(session_id, "{rendered}"),
                tracing::Level::WARN => tracing::warn!(session_id, "{rendered}"),
                tracing::Level::INFO => tracing::info!(session_id, "{rendered}"),
                _ => tracing::debug!(session_id, "{rendered}"),
            }
            Ok(vm.ctx.none())
        })
    }

    let assert_ctx = Rc::clone(&ctx);
    let assert_fn = vm.new_function("assert", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
        let truthy = args.args.first().map(|o| o.try_to_bool(vm).unwrap_or(false)).unwrap_or(false);
        if !truthy {
            let session_id = assert_ctx.current_session_id.get();
            let rest = if args.args.is_empty() { &args.args[..] } else { &args.args[1..] };
            let rendered = format_printf(vm, rest);
            tracing::error!(session_id, "assertion failed: {rendered}");
        }
        Ok(vm.ctx.none())
    });

    namespace(
        vm,
        "console",
        vec![
            ("log", make(vm, Rc::clone(&ctx), tracing::Level::INFO)),
            ("info", make(vm, Rc::clone(&ctx), tracing::Level::INFO)),
            ("warn", make(vm, Rc::clone(&ctx), tracing::Level::WARN)),
            ("error", make(vm, Rc::clone(&ctx), tracing::Level::ERROR)),
            ("assert", assert_fn),
        ],
    )
}

/// Render a `console.*` call's arguments printf-style: `%s` string, `%d`
/// integer, `%j` JSON-encodes the argument. Extra arguments beyond the
/// format placeholders are appended space-separated, matching the original's
/// permissive logging calls (`utils.LogInfo("...", args...)`).
fn format_printf(vm: &VirtualMachine, args: &[PyObjectRef]) -> String {
    let Some(fmt) = args.first().and_then(|o| o.str(vm).ok()) else {
        return String::new();
    };
    let fmt = fmt.as_str();
    let mut out = String::new();
    let mut arg_idx = 1;
    let mut chars = fmt.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '%' {
            match chars.peek() {
                Some('s') => {
                    chars.next();
                    if let Some(a) = args.get(arg_idx) {
                        out.push_str(&a.str(vm).map(|s| s.as_str().to_owned()).unwrap_or_default());
                        arg_idx += 1;
                    }
                    continue;
                }
                Some('d') => {
                    chars.next();
                    if let Some(a) = args.get(arg_idx) {
                        let v = py_to_value(vm, a);
                        out.push_str(&v.as_i64().map(|i| i.to_string()).unwrap_or_default());
                        arg_idx += 1;
                    }
                    continue;
                }
                Some('j') => {
                    chars.next();
                    if let Some(a) = args.get(arg_idx) {
                        let v = py_to_value(vm, a);
                        out.push_str(&value_to_json(&v).to_string());
                        arg_idx += 1;
                    }
                    continue;
                }
                _ => {}
            }
        }
        out.push(c);
    }
    for extra in args.iter().skip(arg_idx) {
        out.push(' ');
        out.push_str(&extra.str(vm).map(|s| s.as_str().to_owned()).unwrap_or_default());
    }
    out
}

