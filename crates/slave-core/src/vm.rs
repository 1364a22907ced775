//! Embedded script interpreter lifecycle (C2).
//!
//! This module owns every RustPython API call for the worker, the way the
//! teacher's `vm.rs` owned every RustPython call for snippet execution. The
//! shape is different: instead of "compile and run one string, then throw the
//! interpreter away," a [`PyInterp`] loads one script file exactly once at
//! startup, installs the bridge host objects (§6.3) into its global scope, and
//! then lives for the lifetime of its pool slot thread, answering many later
//! hook calls (`__enter__`/`__leave__`/`__message__`) against that same scope.
//!
//! `PyInterp` is intentionally not `Send` — exactly as the teacher's comment
//! warns — so it never leaves the OS thread that created it.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::{Arc, OnceLock};

use rustpython_vm::{compiler::Mode, scope::Scope, AsObject, Interpreter, PyObjectRef, PyResult, VirtualMachine};

use crate::bridge;
use crate::storage::Storage;
use crate::transport::Transport;
use crate::types::{ScriptError, SessionId, Value};

/// A one-shot gate ensuring `__init__` runs exactly once across every VM in a
/// pool, regardless of which slot thread's `load()` gets there first. The
/// first `load()` to reach `get_or_init` runs `__init__` and caches its
/// return code; every later `load()` on every other slot thread just reads
/// the cached value back out.
static INIT_GATE: OnceLock<i64> = OnceLock::new();

/// Per-checkout scratch state, reset to its zero value before a VM returns to
/// the pool. Lives behind an `Rc` because bridge closures installed at load
/// time capture it by handle; it never needs to be `Send` because it never
/// leaves the slot thread.
pub(crate) struct VmContext {
    pub current_session_id: Cell<SessionId>,
    pub associated_source_id: Cell<u64>,
    pub associated_source_addr: RefCell<String>,
    pub default_lock_key: Cell<u64>,
    pub held_lock_serial: Cell<i64>,
    pub redis_handle_key: Cell<u64>,
    pub redis_open: Cell<bool>,
    pub invocation_count: Cell<u64>,
    pub storage: Arc<dyn Storage>,
    pub transport: Arc<dyn Transport>,
}

impl VmContext {
    fn new(storage: Arc<dyn Storage>, transport: Arc<dyn Transport>) -> Self {
        VmContext {
            current_session_id: Cell::new(0),
            associated_source_id: Cell::new(0),
            associated_source_addr: RefCell::new(String::new()),
            default_lock_key: Cell::new(0),
            held_lock_serial: Cell::new(0),
            redis_handle_key: Cell::new(0),
            redis_open: Cell::new(false),
            invocation_count: Cell::new(0),
            storage,
            transport,
        }
    }

    /// True once every scratch field is back at its zero value — the
    /// invariant a VM must satisfy before it rejoins the idle queue.
    pub(crate) fn is_clean(&self) -> bool {
        self.default_lock_key.get() == 0
            && self.held_lock_serial.get() == 0
            && self.redis_handle_key.get() == 0
            && !self.redis_open.get()
            && self.associated_source_id.get() == 0
            && self.associated_source_addr.borrow().is_empty()
    }
}

/// One frame's original-source position, as recorded by a sibling `.map`
/// sourcemap file.
struct SourceMapFrame {
    file: String,
    line: u32,
    col: u32,
}

/// Maps a generated (runtime) line number back to the original file/line/col
/// it was authored at. Loaded from an optional `<script>.map` file sitting
/// next to the script: a JSON object of `{"<generated line>": {"file":
/// ..., "line": ..., "col": ...}}` entries. Absent entirely when no `.map`
/// file exists — the worker runs fine without one, exactly as §4.2 requires.
struct SourceMap {
    frames: BTreeMap<u32, SourceMapFrame>,
}

impl SourceMap {
    fn load(script_path: &str) -> Option<Self> {
        let map_path = format!("{script_path}.map");
        let raw = std::fs::read_to_string(map_path).ok()?;
        let json: serde_json::Value = serde_json::from_str(&raw).ok()?;
        let obj = json.as_object()?;
        let mut frames = BTreeMap::new();
        for (line_str, entry) in obj {
            let Ok(line) = line_str.parse::<u32>() else { continue };
            let file = entry.get("file").and_then(|v| v.as_str()).unwrap_or(script_path).to_owned();
            let orig_line = entry.get("line").and_then(|v| v.as_u64()).unwrap_or(line as u64) as u32;
            let col = entry.get("col").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
            frames.insert(line, SourceMapFrame { file, line: orig_line, col });
        }
        Some(SourceMap { frames })
    }

    fn resolve(&self, generated_line: u32) -> Option<&SourceMapFrame> {
        self.frames.get(&generated_line)
    }
}

/// One embedded interpreter plus the loaded script's persistent global scope
/// and its bridge scratch context.
pub(crate) struct PyInterp {
    inner: Interpreter,
    scope: RefCell<Option<Scope>>,
    ctx: Rc<VmContext>,
    source_map: RefCell<Option<SourceMap>>,
}

impl PyInterp {
    /// Execute a closure with access to the `VirtualMachine`. Used for the
    /// recycle path (`pool.rs`) and by `load()`.
    pub(crate) fn with_vm<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&VirtualMachine) -> R,
    {
        self.inner.enter(f)
    }

    pub(crate) fn context(&self) -> &Rc<VmContext> {
        &self.ctx
    }

    /// Load and run `path`, installing the bridge objects and invoking
    /// `__init__`/`__main__` per the one-shot/per-VM contracts in §4.2.
    pub(crate) fn load(&self, path: &str) -> Result<(), ScriptError> {
        let source = std::fs::read_to_string(path).map_err(|e| ScriptError::LoadFailed {
            message: format!("cannot read {path}: {e}"),
        })?;
        *self.source_map.borrow_mut() = SourceMap::load(path);

        self.with_vm(|vm| {
            let scope = vm.new_scope_with_builtins();
            bridge::install(vm, &scope, Rc::clone(&self.ctx));

            let code = vm
                .compile(&source, Mode::Exec, path.to_owned())
                .map_err(|e| ScriptError::SyntaxError {
                    message: e.to_string(),
                    line: e.python_location().0 as u32,
                    col: e.python_location().1 as u32,
                })?;

            vm.run_code_obj(code, scope.clone())
                .map_err(|exc| self.format_script_error(vm, exc))?;

            let gate_result = *INIT_GATE.get_or_init(|| match call_init_hook(vm, &scope) {
                Ok(code) => code,
                Err(exc) => {
                    let err = self.format_script_error(vm, exc);
                    tracing::error!(error = ?err, "__init__ raised an exception");
                    -1
                }
            });
            if gate_result != 0 {
                return Err(ScriptError::LoadFailed {
                    message: format!("__init__ returned {gate_result}"),
                });
            }

            if scope.globals.contains_key("__main__", vm) {
                if let Err(exc) = call_hook_unit(vm, &scope, "__main__") {
                    let err = self.format_script_error(vm, exc);
                    tracing::error!(error = ?err, "__main__ raised an exception");
                }
            }

            *self.scope.borrow_mut() = Some(scope);
            Ok(())
        })
    }

    pub(crate) fn dispatch_enter(&self, session_id: SessionId, addr: &str) {
        self.invoke_hook("__enter__", |vm, scope| {
            call_hook_args(vm, scope, "__enter__", &[vm.ctx.new_int(session_id).into(), vm.ctx.new_str(addr).into()])
        });
    }

    pub(crate) fn dispatch_leave(&self, session_id: SessionId, addr: &str) {
        self.invoke_hook("__leave__", |vm, scope| {
            call_hook_args(vm, scope, "__leave__", &[vm.ctx.new_int(session_id).into(), vm.ctx.new_str(addr).into()])
        });
    }

    pub(crate) fn dispatch_message(&self, session_id: SessionId, body: &std::collections::BTreeMap<i64, Value>) {
        self.invoke_hook("__message__", |vm, scope| {
            let pybody = bridge::value_map_to_py(vm, body);
            call_hook_args(vm, scope, "__message__", &[vm.ctx.new_int(session_id).into(), pybody])
        });
    }

    /// Write the `CurrentSessionId` host global. Writing `0` is the signal
    /// that the VM is idle again; any lock still held or Redis handle still
    /// open on the default key is released synchronously (§4.2).
    pub(crate) fn set_current_session(&self, session_id: SessionId) {
        self.ctx.current_session_id.set(session_id);
        self.with_vm(|vm| {
            if let Some(scope) = self.scope.borrow().as_ref() {
                let _ = scope.globals.set_item("CurrentSessionId", vm.ctx.new_int(session_id).into(), vm);
            }
        });

        if session_id == 0 {
            let held = self.ctx.held_lock_serial.get();
            if held != 0 {
                let key = self.ctx.default_lock_key.get();
                self.ctx.storage.unlock(key, held);
                self.ctx.held_lock_serial.set(0);
            }
            self.ctx.default_lock_key.set(0);
            if self.ctx.redis_open.get() {
                self.ctx.redis_open.set(false);
                self.ctx.redis_handle_key.set(0);
            }
            self.ctx.associated_source_id.set(0);
            *self.ctx.associated_source_addr.borrow_mut() = String::new();
        }
    }

    /// Invoke an optional hook. A script that never defines `name` (all of
    /// `__main__`/`__enter__`/`__leave__`/`__message__` are optional per
    /// §6.3) is not an error: we skip silently rather than logging a missing
    /// global as if it were a raised exception.
    fn invoke_hook<F>(&self, name: &str, f: F)
    where
        F: FnOnce(&VirtualMachine, &Scope) -> PyResult<PyObjectRef>,
    {
        self.with_vm(|vm| {
            let scope_ref = self.scope.borrow();
            let Some(scope) = scope_ref.as_ref() else { return };
            if !scope.globals.contains_key(name, vm) {
                return;
            }
            self.ctx.invocation_count.set(self.ctx.invocation_count.get() + 1);
            if let Err(exc) = f(vm, scope) {
                let err = self.format_script_error(vm, exc);
                tracing::error!(hook = name, error = ?err, "script hook raised an exception");
            }
        });
    }

    /// Build a [`ScriptError::RuntimeError`] from a raised Python exception,
    /// decorating the traceback with original-source positions when a
    /// sourcemap is loaded (§4.2, §7): each `File "...", line N` frame that
    /// has a sourcemap entry gets an appended `-> original file:line:col
    /// (frame i)` annotation, numbered in traceback order.
    fn format_script_error(&self, vm: &VirtualMachine, exc: rustpython_vm::builtins::PyBaseExceptionRef) -> ScriptError {
        let message = exc
            .as_object()
            .str(vm)
            .map(|s| s.as_str().to_owned())
            .unwrap_or_else(|_| "unknown script error".to_owned());
        let mut traceback = String::new();
        let _ = vm.write_exception(&mut traceback, &exc);

        if let Some(map) = self.source_map.borrow().as_ref() {
            traceback = decorate_traceback(&traceback, map);
        }

        ScriptError::RuntimeError { message, traceback }
    }

    /// Current per-VM invocation count, used by the pool to decide when to
    /// recycle this slot's interpreter.
    pub(crate) fn invocation_count(&self) -> u64 {
        self.ctx.invocation_count.get()
    }

    /// Reset the invocation counter after a recycle-triggered reload.
    pub(crate) fn reset_invocation_count(&self) {
        self.ctx.invocation_count.set(0);
    }
}

/// Run `__init__`, propagating a raised exception instead of swallowing it —
/// the one-shot gate must see the failure so `load()` can report it rather
/// than silently treating an exception as a `0` (success) return code.
fn call_init_hook(vm: &VirtualMachine, scope: &Scope) -> PyResult<i64> {
    use rustpython_vm::TryFromObject;
    let func = scope.globals.as_object().get_item("__init__", vm)?;
    let result = vm.invoke(&func, ())?;
    i64::try_from_object(vm, result)
}

fn call_hook_unit(vm: &VirtualMachine, scope: &Scope, name: &str) -> PyResult<()> {
    let func = scope.globals.as_object().get_item(name, vm)?;
    vm.invoke(&func, ())?;
    Ok(())
}

fn call_hook_args(vm: &VirtualMachine, scope: &Scope, name: &str, args: &[PyObjectRef]) -> PyResult<PyObjectRef> {
    let func = scope.globals.as_object().get_item(name, vm)?;
    vm.invoke(&func, args.to_vec())
}

/// Append a `-> original file:line:col (frame i)` annotation to every
/// `File "...", line N` frame in `traceback` that the sourcemap covers,
/// numbered in traceback order (outermost frame first, matching CPython's
/// own convention).
fn decorate_traceback(traceback: &str, map: &SourceMap) -> String {
    let mut out = String::with_capacity(traceback.len());
    let mut frame_idx = 0u32;
    for line in traceback.lines() {
        out.push_str(line);
        if let Some(generated_line) = parse_traceback_line(line) {
            if let Some(frame) = map.resolve(generated_line) {
                out.push_str(&format!(" -> {}:{}:{} (frame {frame_idx})", frame.file, frame.line, frame.col));
                frame_idx += 1;
            }
        }
        out.push('\n');
    }
    out
}

/// Extract the generated line number out of a CPython-style
/// `File "path", line N, in func` traceback frame line.
fn parse_traceback_line(line: &str) -> Option<u32> {
    let trimmed = line.trim_start();
    if !trimmed.starts_with("File \"") {
        return None;
    }
    let after_line_kw = trimmed.split_once(", line ")?.1;
    let digits: String = after_line_kw.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Build a fresh interpreter with the stdlib modules the corpus of scripts is
/// expected to use (json in particular, since bodies are maps of `Value`).
/// Grounded on the teacher's `build_interpreter`: same native-module
/// registration, same frozen pure-Python `json` shim.
pub(crate) fn build_interpreter(storage: Arc<dyn Storage>, transport: Arc<dyn Transport>) -> PyInterp {
    let settings = rustpython_vm::Settings::default();
    let inner = Interpreter::with_init(settings, move |vm| {
        vm.add_native_modules(rustpython_stdlib::get_module_inits());
    });

    PyInterp {
        inner,
        scope: RefCell::new(None),
        ctx: Rc::new(VmContext::new(storage, transport)),
        source_map: RefCell::new(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NullStorage;
    use crate::transport::{ChannelTransport, Transport as _};
    use std::io::Write as _;

    fn make_interp() -> PyInterp {
        let (tcp_tx, _tcp_rx) = tokio::sync::mpsc::unbounded_channel();
        let (dg_tx, _dg_rx) = tokio::sync::mpsc::unbounded_channel();
        let transport: Arc<dyn Transport> = Arc::new(ChannelTransport::new(tcp_tx, dg_tx));
        build_interpreter(Arc::new(NullStorage), transport)
    }

    #[test]
    fn sourcemap_resolves_generated_line_to_original_position() {
        let path = std::env::temp_dir().join(format!("slave_core_sourcemap_test_{}.py", std::process::id()));
        let map_path = format!("{}.map", path.to_str().unwrap());
        std::fs::write(&map_path, r#"{"3": {"file": "app.ts", "line": 12, "col": 4}}"#).unwrap();

        let map = SourceMap::load(path.to_str().unwrap()).expect("sourcemap should load");
        let frame = map.resolve(3).expect("line 3 should resolve");
        assert_eq!(frame.file, "app.ts");
        assert_eq!(frame.line, 12);
        assert_eq!(frame.col, 4);
        assert!(map.resolve(99).is_none());

        let _ = std::fs::remove_file(&map_path);
    }

    #[test]
    fn sourcemap_load_returns_none_without_a_map_file() {
        assert!(SourceMap::load("/tmp/slave_core_never_exists_12345.py").is_none());
    }

    #[test]
    fn decorate_traceback_annotates_mapped_frames_in_order() {
        let mut frames = BTreeMap::new();
        frames.insert(2, SourceMapFrame { file: "app.ts".to_string(), line: 9, col: 1 });
        let map = SourceMap { frames };

        let traceback = "Traceback (most recent call last):\n  File \"app.py\", line 2, in __message__\nNameError: x\n";
        let decorated = decorate_traceback(traceback, &map);

        assert!(decorated.contains("-> app.ts:9:1 (frame 0)"), "got: {decorated}");
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn fresh_context_is_clean() {
        let interp = make_interp();
        assert!(interp.context().is_clean());
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn load_runs_init_and_main_once() {
        let mut file = tempfile_with(
            "calls = []\n\
             def __init__():\n\
             \tcalls.append('init')\n\
             \treturn 0\n\
             def __main__():\n\
             \tcalls.append('main')\n",
        );
        let interp = make_interp();
        interp.load(file.path_str()).expect("load should succeed");
        file.cleanup();
    }

    struct TempScript {
        path: std::path::PathBuf,
    }

    impl TempScript {
        fn path_str(&self) -> &str {
            self.path.to_str().unwrap()
        }
        fn cleanup(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    fn tempfile_with(src: &str) -> TempScript {
        let path = std::env::temp_dir().join(format!("slave_core_test_{}.py", std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(src.as_bytes()).unwrap();
        TempScript { path }
    }
}
