//! WASM Runtime - Executes compiled Rego policies through the OPA WASM ABI.
//!
//! One module carries one entrypoint per phase query. Entrypoint ids are
//! resolved once at construction; every evaluation then gets a fresh
//! [`Store`], so linear memory and the print buffer are never shared between
//! calls.

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, error, instrument, trace, warn};
use wasmtime::*;

/// Round a byte budget up to whole 64KB pages.
fn bytes_to_wasm_pages(bytes: u64) -> u32 {
    (bytes as f64 / 65536.0).ceil() as u32
}

/// Initial and maximum page counts for a policy instance, clamped to 1MB..100MB.
///
/// If no override is given, uses the default of 10MB.
fn get_memory_config(max_memory_bytes_override: Option<usize>) -> (u32, Option<u32>) {
    const DEFAULT_INITIAL_PAGES: u32 = 5; // 320KB
    const DEFAULT_MAX_MEMORY_BYTES: u64 = 10 * 1024 * 1024; // 10MB
    const ABSOLUTE_MIN_MEMORY_BYTES: u64 = 1024 * 1024; // 1MB
    const ABSOLUTE_MAX_MEMORY_BYTES: u64 = 100 * 1024 * 1024; // 100MB

    let mut max_memory_bytes = max_memory_bytes_override
        .map(|b| b as u64)
        .unwrap_or(DEFAULT_MAX_MEMORY_BYTES);

    if max_memory_bytes < ABSOLUTE_MIN_MEMORY_BYTES {
        warn!(
            "Requested max memory ({} bytes) is below minimum ({}). Using minimum.",
            max_memory_bytes, ABSOLUTE_MIN_MEMORY_BYTES
        );
        max_memory_bytes = ABSOLUTE_MIN_MEMORY_BYTES;
    }

    if max_memory_bytes > ABSOLUTE_MAX_MEMORY_BYTES {
        warn!(
            "Requested max memory ({} bytes) exceeds absolute maximum ({}). Capping at maximum.",
            max_memory_bytes, ABSOLUTE_MAX_MEMORY_BYTES
        );
        max_memory_bytes = ABSOLUTE_MAX_MEMORY_BYTES;
    }

    let max_pages = bytes_to_wasm_pages(max_memory_bytes);
    (DEFAULT_INITIAL_PAGES, Some(max_pages))
}

/// Result of running one entrypoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    /// One value per result set; empty means undefined.
    pub results: Vec<Value>,
    /// Lines emitted by Rego `print()` during this call only.
    pub print_output: Vec<String>,
}

/// Per-call host state. Lives exactly as long as one `Store`.
#[derive(Default)]
struct HostState {
    memory: Option<Memory>,
    print_output: Vec<String>,
}

/// A compiled policy module and its resolved entrypoints.
pub struct WasmRuntime {
    engine: Engine,
    module: Module,
    /// Entrypoint path (e.g. "cleanroom/policy/on_request_body") -> id
    entrypoints: HashMap<String, i32>,
    /// Bundle data document, pre-serialized
    data_json: Option<String>,
    /// Optional max memory override (in bytes)
    max_memory_bytes: Option<usize>,
}

impl std::fmt::Debug for WasmRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmRuntime")
            .field("entrypoints", &self.entrypoints)
            .field("has_data", &self.data_json.is_some())
            .field("max_memory_bytes", &self.max_memory_bytes)
            .finish_non_exhaustive()
    }
}

impl WasmRuntime {
    /// Create a new runtime from compiled WASM bytes with no bundle data.
    pub fn new(wasm_bytes: &[u8]) -> Result<Self> {
        Self::new_with_config(wasm_bytes, None, None)
    }

    /// Create a new runtime with bundle data and a memory limit.
    ///
    /// `wasm_bytes` may also be WebAssembly text, which is convenient for
    /// hand-written fixtures.
    pub fn new_with_config(
        wasm_bytes: &[u8],
        data: Option<&Value>,
        max_memory_bytes: Option<usize>,
    ) -> Result<Self> {
        debug!("Initializing WASM runtime");

        let mut config = Config::new();
        config.wasm_multi_memory(true);
        config.wasm_multi_value(true);

        let engine = Engine::new(&config)?;
        let module = Module::new(&engine, wasm_bytes).context("Failed to load WASM module")?;

        let data_json = data
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize bundle data")?;

        let mut runtime = Self {
            engine,
            module,
            entrypoints: HashMap::new(),
            data_json,
            max_memory_bytes,
        };
        runtime.entrypoints = runtime
            .read_entrypoints()
            .context("Failed to read entrypoints from WASM module")?;

        debug!(
            "WASM module loaded successfully with {} entrypoints",
            runtime.entrypoints.len()
        );
        Ok(runtime)
    }

    /// All entrypoints exported by the module.
    pub fn entrypoints(&self) -> &HashMap<String, i32> {
        &self.entrypoints
    }

    /// Resolve an entrypoint path to its id.
    pub fn entrypoint_id(&self, name: &str) -> Option<i32> {
        self.entrypoints.get(name).copied()
    }

    /// Evaluate one entrypoint against `input`.
    /// Every evaluation gets its own Store, so one runtime serves all exchanges.
    #[instrument(
        name = "wasm_evaluate",
        skip(self, input),
        fields(
            input_size_bytes = tracing::field::Empty,
            output_size_bytes = tracing::field::Empty,
            result_count = tracing::field::Empty,
            evaluation_time_ms = tracing::field::Empty
        )
    )]
    pub fn evaluate(&self, entrypoint_id: i32, input: &Value) -> Result<Evaluation> {
        let start = Instant::now();
        let input_json = serde_json::to_string(input)?;

        let (result_json, print_output) = self.evaluate_raw(&input_json, entrypoint_id)?;
        debug!("Raw WASM result JSON: {}", result_json);

        let result_value: Value =
            serde_json::from_str(&result_json).context("Failed to parse result JSON")?;
        let results = extract_results(result_value)?;

        let elapsed = start.elapsed();
        let current_span = tracing::Span::current();
        current_span.record("input_size_bytes", input_json.len());
        current_span.record("output_size_bytes", result_json.len());
        current_span.record("result_count", results.len());
        current_span.record("evaluation_time_ms", elapsed.as_millis());

        trace!(
            results = results.len(),
            duration_ms = elapsed.as_millis(),
            "WASM evaluation complete"
        );

        Ok(Evaluation {
            results,
            print_output,
        })
    }

    /// Instantiate the module in a fresh store with the OPA host imports.
    fn instantiate(&self) -> Result<(Store<HostState>, Instance, Memory)> {
        let mut store = Store::new(&self.engine, HostState::default());
        let mut linker = Linker::new(&self.engine);

        let (initial_pages, max_pages) = get_memory_config(self.max_memory_bytes);
        let memory = Memory::new(&mut store, MemoryType::new(initial_pages, max_pages))?;
        store.data_mut().memory = Some(memory);
        linker.define(&mut store, "env", "memory", memory)?;

        linker.func_wrap(
            "env",
            "opa_abort",
            |caller: Caller<'_, HostState>, addr: i32| -> Result<()> {
                let message = read_host_string(&caller, addr)
                    .unwrap_or_else(|e| format!("<unreadable abort message: {e}>"));
                error!(addr, "OPA policy aborted execution: {}", message);
                Err(anyhow!("policy aborted: {message}"))
            },
        )?;
        linker.func_wrap(
            "env",
            "opa_println",
            |mut caller: Caller<'_, HostState>, addr: i32| -> Result<()> {
                let line = read_host_string(&caller, addr)?;
                caller.data_mut().print_output.push(line);
                Ok(())
            },
        )?;
        // Host builtins are not provided; policies must stick to the builtins
        // OPA compiles into the module.
        linker.func_wrap(
            "env",
            "opa_builtin0",
            |_: Caller<'_, HostState>, _: i32, _: i32| -> i32 { 0 },
        )?;
        linker.func_wrap(
            "env",
            "opa_builtin1",
            |_: Caller<'_, HostState>, _: i32, _: i32, _: i32| -> i32 { 0 },
        )?;
        linker.func_wrap(
            "env",
            "opa_builtin2",
            |_: Caller<'_, HostState>, _: i32, _: i32, _: i32, _: i32| -> i32 { 0 },
        )?;
        linker.func_wrap(
            "env",
            "opa_builtin3",
            |_: Caller<'_, HostState>, _: i32, _: i32, _: i32, _: i32, _: i32| -> i32 { 0 },
        )?;
        linker.func_wrap(
            "env",
            "opa_builtin4",
            |_: Caller<'_, HostState>, _: i32, _: i32, _: i32, _: i32, _: i32, _: i32| -> i32 {
                0
            },
        )?;

        let instance = linker.instantiate(&mut store, &self.module)?;
        Ok((store, instance, memory))
    }

    /// Read the `entrypoints` export as a name -> id map.
    fn read_entrypoints(&self) -> Result<HashMap<String, i32>> {
        let (mut store, instance, memory) = self.instantiate()?;

        let entrypoints = instance.get_typed_func::<(), i32>(&mut store, "entrypoints")?;
        let opa_json_dump = instance.get_typed_func::<i32, i32>(&mut store, "opa_json_dump")?;

        let value_addr = entrypoints.call(&mut store, ())?;
        let json_ptr = opa_json_dump.call(&mut store, value_addr)?;
        let json = read_cstring(memory.data(&store), json_ptr)?;

        serde_json::from_str(&json)
            .with_context(|| format!("entrypoints export is not a name -> id map: {json}"))
    }

    /// Low-level function that interacts with the OPA WASM ABI.
    /// Returns the raw result JSON and whatever the policy printed.
    fn evaluate_raw(&self, input_json: &str, entrypoint_id: i32) -> Result<(String, Vec<String>)> {
        let (mut store, instance, memory) = self.instantiate()?;

        let opa_malloc = instance.get_typed_func::<i32, i32>(&mut store, "opa_malloc")?;
        let opa_heap_ptr_get =
            instance.get_typed_func::<(), i32>(&mut store, "opa_heap_ptr_get")?;
        let opa_eval = instance
            .get_typed_func::<(i32, i32, i32, i32, i32, i32, i32), i32>(&mut store, "opa_eval")?;

        let data_addr = match &self.data_json {
            Some(data) => {
                let opa_json_parse =
                    instance.get_typed_func::<(i32, i32), i32>(&mut store, "opa_json_parse")?;
                let (ptr, len) = write_bytes(&mut store, &memory, &opa_malloc, data.as_bytes())?;
                let addr = opa_json_parse.call(&mut store, (ptr, len))?;
                if addr == 0 {
                    bail!("Failed to parse bundle data inside WASM module");
                }
                addr
            }
            None => 0,
        };

        debug!("WASM input JSON: {}", input_json);
        let (input_ptr, input_len) =
            write_bytes(&mut store, &memory, &opa_malloc, input_json.as_bytes())?;

        let heap_ptr_before = opa_heap_ptr_get.call(&mut store, ())?;

        let result_ptr = opa_eval
            .call(
                &mut store,
                (
                    0,
                    entrypoint_id,
                    data_addr,
                    input_ptr,
                    input_len,
                    heap_ptr_before,
                    0,
                ),
            )
            .with_context(|| format!("opa_eval failed for entrypoint {entrypoint_id}"))?;

        let result = read_cstring(memory.data(&store), result_ptr)?;
        let print_output = std::mem::take(&mut store.data_mut().print_output);
        Ok((result, print_output))
    }
}

/// Copy `bytes` into module memory via `opa_malloc`.
fn write_bytes(
    store: &mut Store<HostState>,
    memory: &Memory,
    opa_malloc: &TypedFunc<i32, i32>,
    bytes: &[u8],
) -> Result<(i32, i32)> {
    let len = i32::try_from(bytes.len()).context("Payload too large for WASM memory")?;
    let ptr = opa_malloc.call(&mut *store, len)?;
    let offset = usize::try_from(ptr).context("opa_malloc returned a negative address")?;
    memory.write(&mut *store, offset, bytes)?;
    Ok((ptr, len))
}

fn read_host_string(caller: &Caller<'_, HostState>, addr: i32) -> Result<String> {
    let memory = caller
        .data()
        .memory
        .context("WASM memory not initialised")?;
    read_cstring(memory.data(caller), addr)
}

/// Read a null-terminated UTF-8 string starting at `ptr`.
fn read_cstring(bytes: &[u8], ptr: i32) -> Result<String> {
    let start = usize::try_from(ptr).context("Negative string address")?;
    let tail = bytes
        .get(start..)
        .context("String address outside WASM memory")?;
    let len = tail
        .iter()
        .position(|b| *b == 0)
        .context("Unterminated string in WASM memory")?;
    Ok(String::from_utf8(tail[..len].to_vec())?)
}

/// Unwrap the OPA result format `[{"result": <value>}, ...]`.
fn extract_results(result: Value) -> Result<Vec<Value>> {
    let Value::Array(sets) = result else {
        bail!("Expected an array of result sets, got: {}", result);
    };

    Ok(sets
        .into_iter()
        .map(|set| match set {
            Value::Object(mut wrapper) if wrapper.contains_key("result") => wrapper
                .remove("result")
                .unwrap_or(Value::Null),
            other => other,
        })
        .collect())
}
