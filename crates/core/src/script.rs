//! Sandboxed script host.
//!
//! Rule scripts are untrusted third-party code. Each run gets a fresh V8
//! isolate through `deno_core` with no extensions besides the capability ops
//! defined here, so there is no filesystem, process, timer or network access.
//! Scripts see:
//!
//! | Global | Capability |
//! | --- | --- |
//! | `result`, `baseUrl`, `key`, `sharedVariables` | evaluation bindings |
//! | `source` | `{ id, name, key, getVariable(), setVariable(v) }` |
//! | `log(msg)`, `toast(msg)` | log sink |
//! | `cookie.get(url)` | cookie reader scoped to the source's domains |
//! | `cache.get(k)`, `cache.put(k, v)` | small key-value cache |
//! | `hosts` | resolved host list, frozen |
//!
//! Everything else on the global object is removed before the rule runs,
//! except the standard ECMAScript built-ins.
//!
//! A watchdog thread terminates the isolate when the deadline passes, so a
//! looping script surfaces as [`QuireError::ScriptError`] instead of hanging.
//! The V8 heap is capped the same way: nearing the limit terminates the run
//! rather than aborting the process.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use deno_core::{JsRuntime, ModuleCodeString, OpState, RuntimeOptions, extension, op2, serde_v8, v8};
use serde_json::{Map, Value, json};

use crate::store::{AuthStore, ScriptCache, VariableStore};
use crate::{QuireError, Result};

/// Default script deadline.
pub const DEFAULT_SCRIPT_TIMEOUT_MS: u64 = 5000;

/// Default V8 heap ceiling per script run.
pub const DEFAULT_SCRIPT_HEAP_LIMIT_MB: usize = 64;

/// The capability surface handed to a script run.
#[derive(Clone)]
pub struct ScriptCapabilities {
    pub source_id: String,
    pub source_name: String,
    /// Key into the [`VariableStore`] for this source.
    pub variable_key: String,
    pub hosts: Vec<String>,
    pub base_url: Option<String>,
    pub auth: Arc<dyn AuthStore>,
    pub variables: Arc<dyn VariableStore>,
    pub cache: Arc<dyn ScriptCache>,
}

impl ScriptCapabilities {
    /// Whether `url` belongs to a domain this source may read cookies for.
    fn may_read_cookies(&self, url: &str) -> bool {
        let Some(host) = host_of(url) else {
            return false;
        };
        self.base_url.iter().chain(self.hosts.iter()).filter_map(|u| host_of(u)).any(|allowed| allowed == host)
    }
}

fn host_of(url: &str) -> Option<String> {
    url::Url::parse(url).ok()?.host_str().map(str::to_ascii_lowercase)
}

/// Values bound into the script's global scope.
#[derive(Debug, Clone, Default)]
pub struct ScriptInput {
    pub result: Value,
    /// Per-run shared variables. Read back after the script finishes.
    pub shared: Map<String, Value>,
    /// Additional globals, e.g. the JSON context of a pseudo-URL.
    pub extra: Map<String, Value>,
}

/// Script completion value plus the shared variables as the script left them.
#[derive(Debug, Clone)]
pub struct ScriptOutput {
    pub value: Value,
    pub shared: Map<String, Value>,
}

#[op2(fast)]
fn op_quire_log(state: &mut OpState, #[string] message: &str) {
    let caps = state.borrow::<ScriptCapabilities>();
    tracing::info!(target: "quire::script", source = %caps.source_id, "{}", message);
}

#[op2(fast)]
fn op_quire_toast(state: &mut OpState, #[string] message: &str) {
    let caps = state.borrow::<ScriptCapabilities>();
    tracing::info!(target: "quire::script", source = %caps.source_id, toast = true, "{}", message);
}

#[op2]
#[string]
fn op_quire_cookie(state: &mut OpState, #[string] url: &str) -> String {
    let caps = state.borrow::<ScriptCapabilities>();
    if caps.may_read_cookies(url) {
        caps.auth.cookie_for_url(&caps.source_id, url)
    } else {
        tracing::debug!(source = %caps.source_id, url = %url, "cookie read outside source domains refused");
        String::new()
    }
}

#[op2]
#[string]
fn op_quire_cache_get(state: &mut OpState, #[string] key: &str) -> String {
    state.borrow::<ScriptCapabilities>().cache.get(key).unwrap_or_default()
}

#[op2(fast)]
fn op_quire_cache_put(state: &mut OpState, #[string] key: &str, #[string] value: &str) {
    state.borrow::<ScriptCapabilities>().cache.put(key, value);
}

#[op2]
#[string]
fn op_quire_get_variable(state: &mut OpState) -> String {
    let caps = state.borrow::<ScriptCapabilities>();
    caps.variables.get_variable(&caps.variable_key).unwrap_or_default()
}

#[op2(fast)]
fn op_quire_set_variable(state: &mut OpState, #[string] value: &str) {
    let caps = state.borrow::<ScriptCapabilities>();
    caps.variables.set_variable(&caps.variable_key, value);
}

extension!(
    quire_sandbox,
    ops = [
        op_quire_log,
        op_quire_toast,
        op_quire_cookie,
        op_quire_cache_get,
        op_quire_cache_put,
        op_quire_get_variable,
        op_quire_set_variable,
    ],
    options = { capabilities: ScriptCapabilities },
    state = |state, options| {
        state.put(options.capabilities);
    },
);

/// Strips the global object down to the ECMAScript built-ins, then wires the
/// capability ops into plain globals. `Deno`, `__bootstrap` and anything else
/// the runtime installed are gone before the rule runs.
const CAPABILITY_BRIDGE: &str = r#"
(() => {
  const ops = Deno.core.ops;
  const bindings = globalThis.__quireBindings;

  const builtins = new Set([
    "globalThis", "undefined", "NaN", "Infinity", "eval", "isFinite", "isNaN", "parseFloat", "parseInt",
    "decodeURI", "decodeURIComponent", "encodeURI", "encodeURIComponent", "escape", "unescape",
    "Object", "Function", "Array", "Number", "Boolean", "String", "Symbol", "BigInt", "Math", "JSON", "Date",
    "RegExp", "Map", "Set", "WeakMap", "WeakSet", "WeakRef", "Promise", "Proxy", "Reflect", "Intl", "Iterator",
    "Error", "AggregateError", "EvalError", "RangeError", "ReferenceError", "SyntaxError", "TypeError", "URIError",
    "ArrayBuffer", "DataView", "Int8Array", "Uint8Array", "Uint8ClampedArray", "Int16Array", "Uint16Array",
    "Int32Array", "Uint32Array", "Float32Array", "Float64Array", "BigInt64Array", "BigUint64Array",
  ]);
  for (const name of Object.getOwnPropertyNames(globalThis)) {
    if (!builtins.has(name)) {
      try { delete globalThis[name]; } catch (_) {}
    }
  }

  globalThis.result = bindings.result;
  globalThis.baseUrl = bindings.baseUrl;
  globalThis.key = bindings.key;
  globalThis.sharedVariables = bindings.sharedVariables;
  globalThis.hosts = Object.freeze(bindings.hosts);
  for (const [name, value] of Object.entries(bindings.extra)) {
    globalThis[name] = value;
  }

  globalThis.log = (msg) => { ops.op_quire_log(String(msg)); return msg; };
  globalThis.toast = (msg) => { ops.op_quire_toast(String(msg)); };
  globalThis.cookie = Object.freeze({
    get: (url) => ops.op_quire_cookie(String(url)),
  });
  globalThis.cache = Object.freeze({
    get: (k) => ops.op_quire_cache_get(String(k)),
    put: (k, v) => {
      ops.op_quire_cache_put(String(k), typeof v === "string" ? v : JSON.stringify(v));
      return v;
    },
  });
  globalThis.source = Object.freeze({
    id: bindings.source.id,
    name: bindings.source.name,
    key: bindings.source.key,
    getVariable: () => ops.op_quire_get_variable(),
    setVariable: (v) => { ops.op_quire_set_variable(v == null ? "" : String(v)); },
  });
})();
"#;

const READ_SHARED: &str = "JSON.stringify(globalThis.sharedVariables ?? {})";

/// Time- and memory-bounded executor for untrusted script text.
#[derive(Debug, Clone)]
pub struct ScriptHost {
    timeout: Duration,
    heap_limit: usize,
}

impl Default for ScriptHost {
    fn default() -> Self {
        Self::new(DEFAULT_SCRIPT_TIMEOUT_MS)
    }
}

impl ScriptHost {
    pub fn new(timeout_ms: u64) -> Self {
        Self { timeout: Duration::from_millis(timeout_ms), heap_limit: DEFAULT_SCRIPT_HEAP_LIMIT_MB << 20 }
    }

    /// Caps the V8 heap of each run at `megabytes`.
    pub fn with_heap_limit_mb(mut self, megabytes: usize) -> Self {
        self.heap_limit = megabytes.max(1) << 20;
        self
    }

    /// Runs `body` and returns its completion value.
    pub fn run(&self, body: &str, input: ScriptInput, capabilities: ScriptCapabilities) -> Result<ScriptOutput> {
        self.execute(body.to_string(), input, capabilities)
    }

    /// Runs `body` once per item in a single isolate, binding the item as
    /// `result` and as `item_name`, and the 1-based position as `index`.
    pub fn run_each(
        &self, body: &str, item_name: &str, items: &[Value], input: ScriptInput, capabilities: ScriptCapabilities,
    ) -> Result<Vec<Value>> {
        let driver = format!(
            r#"(() => {{
  const body = {body};
  const items = {items};
  const out = [];
  for (let i = 0; i < items.length; i++) {{
    globalThis.index = i + 1;
    globalThis.result = items[i];
    globalThis[{name}] = items[i];
    const value = (0, eval)(body);
    out.push(value === undefined ? null : value);
  }}
  return out;
}})()"#,
            body = Value::String(body.to_string()),
            items = Value::Array(items.to_vec()),
            name = Value::String(item_name.to_string()),
        );

        let output = self.execute(driver, input, capabilities)?;
        match output.value {
            Value::Array(values) => Ok(values),
            other => Err(QuireError::script(format!("expected an array from batch run, got {}", other))),
        }
    }

    fn execute(&self, code: String, input: ScriptInput, capabilities: ScriptCapabilities) -> Result<ScriptOutput> {
        let bindings = json!({
            "result": input.result,
            "baseUrl": capabilities.base_url,
            "key": capabilities.variable_key,
            "sharedVariables": Value::Object(input.shared.clone()),
            "hosts": capabilities.hosts,
            "extra": Value::Object(input.extra),
            "source": {
                "id": capabilities.source_id,
                "name": capabilities.source_name,
                "key": capabilities.variable_key,
            },
        });
        let prelude = format!("globalThis.__quireBindings = {};{}", bindings, CAPABILITY_BRIDGE);

        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![quire_sandbox::init_ops(capabilities)],
            create_params: Some(v8::CreateParams::default().heap_limits(0, self.heap_limit)),
            ..Default::default()
        });

        let exhausted = Arc::new(AtomicBool::new(false));
        {
            let exhausted = exhausted.clone();
            let isolate = runtime.v8_isolate().thread_safe_handle();
            runtime.add_near_heap_limit_callback(move |current, _initial| {
                exhausted.store(true, Ordering::SeqCst);
                isolate.terminate_execution();
                // Headroom for the termination to unwind.
                current * 2
            });
        }
        let watchdog = Watchdog::arm(runtime.v8_isolate().thread_safe_handle(), self.timeout);

        let completion = runtime
            .execute_script("quire:prelude", ModuleCodeString::from(prelude))
            .and_then(|_| runtime.execute_script("quire:rule", ModuleCodeString::from(code)));

        let global = match completion {
            Ok(global) => global,
            Err(e) => {
                let fired = watchdog.disarm();
                if exhausted.load(Ordering::SeqCst) {
                    return Err(self.out_of_memory());
                }
                return Err(self.failure(fired, e.to_string()));
            }
        };

        let value = {
            let scope = &mut runtime.handle_scope();
            let local = v8::Local::new(scope, global);
            to_json(scope, local)
        };

        let shared = runtime
            .execute_script("quire:shared", ModuleCodeString::from(READ_SHARED.to_string()))
            .ok()
            .and_then(|global| {
                let scope = &mut runtime.handle_scope();
                let local = v8::Local::new(scope, global);
                serde_v8::from_v8::<String>(scope, local).ok()
            })
            .and_then(|text| serde_json::from_str::<Map<String, Value>>(&text).ok())
            .unwrap_or(input.shared);

        if watchdog.disarm() {
            return Err(self.failure(true, String::new()));
        }

        Ok(ScriptOutput { value, shared })
    }

    fn out_of_memory(&self) -> QuireError {
        QuireError::script(format!("script exceeded heap limit of {} MB", self.heap_limit >> 20))
    }

    fn failure(&self, timed_out: bool, message: String) -> QuireError {
        if timed_out {
            QuireError::script(format!("script timed out after {} ms", self.timeout.as_millis()))
        } else {
            QuireError::script(message)
        }
    }
}

fn to_json(scope: &mut v8::HandleScope, local: v8::Local<v8::Value>) -> Value {
    if local.is_null_or_undefined() {
        return Value::Null;
    }
    match serde_v8::from_v8::<Value>(scope, local) {
        Ok(value) => value,
        Err(_) => Value::String(local.to_rust_string_lossy(scope)),
    }
}

/// Terminates the isolate if it is still running when the deadline passes.
struct Watchdog {
    done: mpsc::Sender<()>,
    handle: JoinHandle<bool>,
}

impl Watchdog {
    fn arm(isolate: v8::IsolateHandle, timeout: Duration) -> Self {
        let (done, finished) = mpsc::channel::<()>();
        let handle = thread::spawn(move || match finished.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                isolate.terminate_execution();
                true
            }
            _ => false,
        });
        Self { done, handle }
    }

    /// Stops the watchdog and reports whether it fired.
    fn disarm(self) -> bool {
        let _ = self.done.send(());
        self.handle.join().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn capabilities(store: &MemoryStore) -> ScriptCapabilities {
        ScriptCapabilities {
            source_id: "src".to_string(),
            source_name: "Test Source".to_string(),
            variable_key: "src:vars".to_string(),
            hosts: vec!["https://books.example".to_string()],
            base_url: Some("https://books.example/book/1".to_string()),
            auth: Arc::new(store.clone()),
            variables: Arc::new(store.clone()),
            cache: Arc::new(store.clone()),
        }
    }

    fn input(result: Value) -> ScriptInput {
        ScriptInput { result, ..Default::default() }
    }

    #[test]
    fn test_completion_value() {
        let store = MemoryStore::new();
        let host = ScriptHost::default();
        let out = host.run("result.toUpperCase()", input(json!("abc")), capabilities(&store)).unwrap();
        assert_eq!(out.value, json!("ABC"));
    }

    #[test]
    fn test_object_completion_value() {
        let store = MemoryStore::new();
        let host = ScriptHost::default();
        let out = host.run("({a: result.length, b: [1, 2]})", input(json!("xyz")), capabilities(&store)).unwrap();
        assert_eq!(out.value, json!({"a": 3, "b": [1, 2]}));
    }

    #[test]
    fn test_throw_is_script_error() {
        let store = MemoryStore::new();
        let host = ScriptHost::default();
        let err = host.run("throw new Error('boom')", input(Value::Null), capabilities(&store)).unwrap_err();
        assert!(matches!(err, QuireError::ScriptError { .. }));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_timeout_is_script_error() {
        let store = MemoryStore::new();
        let host = ScriptHost::new(200);
        let started = std::time::Instant::now();
        let err = host.run("while (true) {}", input(Value::Null), capabilities(&store)).unwrap_err();

        assert!(matches!(err, QuireError::ScriptError { .. }));
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_no_ambient_capabilities() {
        let store = MemoryStore::new();
        let host = ScriptHost::default();
        let out = host
            .run(
                "[typeof Deno, typeof require, typeof fetch, typeof setTimeout].join(',')",
                input(Value::Null),
                capabilities(&store),
            )
            .unwrap();
        assert_eq!(out.value, json!("undefined,undefined,undefined,undefined"));
    }

    #[test]
    fn test_runtime_internals_removed() {
        let store = MemoryStore::new();
        let host = ScriptHost::default();
        let out = host
            .run(
                "[typeof __bootstrap, typeof __infra, typeof globalThis.Deno, typeof console, typeof queueMicrotask].join(',')",
                input(Value::Null),
                capabilities(&store),
            )
            .unwrap();
        assert_eq!(out.value, json!("undefined,undefined,undefined,undefined,undefined"));

        let names = host
            .run(
                "Object.getOwnPropertyNames(globalThis).filter(n => n.startsWith('__') || n === 'Deno')",
                input(Value::Null),
                capabilities(&store),
            )
            .unwrap();
        assert_eq!(names.value, json!([]));
    }

    #[test]
    fn test_builtins_survive_cleanup() {
        let store = MemoryStore::new();
        let host = ScriptHost::default();
        let out = host
            .run(
                "JSON.stringify([Math.max(1, 2), parseInt('7'), new Map([[1, 2]]).size, /a+/.test('aa'), encodeURIComponent('a b')])",
                input(Value::Null),
                capabilities(&store),
            )
            .unwrap();
        assert_eq!(out.value, json!("[2,7,1,true,\"a%20b\"]"));
    }

    #[test]
    fn test_heap_exhaustion_is_script_error() {
        let store = MemoryStore::new();
        let host = ScriptHost::new(10_000).with_heap_limit_mb(32);
        let err = host
            .run(
                "const hoard = []; while (true) { hoard.push(new Array(1e6).fill(1.5)); }",
                input(Value::Null),
                capabilities(&store),
            )
            .unwrap_err();

        assert!(matches!(err, QuireError::ScriptError { .. }));
        assert!(err.to_string().contains("heap limit"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_variable_and_cache_capabilities() {
        let store = MemoryStore::new();
        let host = ScriptHost::default();
        host.run("source.setVariable('uid=7'); cache.put('t', 'x')", input(Value::Null), capabilities(&store))
            .unwrap();

        assert_eq!(store.get_variable("src:vars"), Some("uid=7".to_string()));
        let out = host.run("source.getVariable() + '|' + cache.get('t')", input(Value::Null), capabilities(&store));
        assert_eq!(out.unwrap().value, json!("uid=7|x"));
    }

    #[test]
    fn test_cookie_reader_is_domain_scoped() {
        let store = MemoryStore::new();
        store.set_cookie("src", "https://books.example/", "sid=1");
        store.set_cookie("src", "https://elsewhere.example/", "sid=2");
        let host = ScriptHost::default();

        let out = host
            .run(
                "cookie.get('https://books.example/x') + '|' + cookie.get('https://elsewhere.example/x')",
                input(Value::Null),
                capabilities(&store),
            )
            .unwrap();
        assert_eq!(out.value, json!("sid=1|"));
    }

    #[test]
    fn test_shared_variables_round_trip() {
        let store = MemoryStore::new();
        let host = ScriptHost::default();
        let mut shared = Map::new();
        shared.insert("page".to_string(), json!(1));

        let out = host
            .run(
                "sharedVariables.page += 1; sharedVariables.token = 'abc'; hosts[0]",
                ScriptInput { result: Value::Null, shared, extra: Map::new() },
                capabilities(&store),
            )
            .unwrap();

        assert_eq!(out.value, json!("https://books.example"));
        assert_eq!(out.shared.get("page"), Some(&json!(2)));
        assert_eq!(out.shared.get("token"), Some(&json!("abc")));
    }

    #[test]
    fn test_run_each() {
        let store = MemoryStore::new();
        let host = ScriptHost::default();
        let items = vec![json!("first"), json!("second")];
        let values = host
            .run_each("index + '. ' + title", "title", &items, input(Value::Null), capabilities(&store))
            .unwrap();
        assert_eq!(values, vec![json!("1. first"), json!("2. second")]);
    }
}
