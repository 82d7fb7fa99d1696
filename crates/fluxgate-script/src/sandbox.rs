//! Sandboxed execution of tenant-supplied scripts.
//!
//! Runs transformation and scheduling code written in Rhai against a payload
//! and context, under CPU/time/size limits. A fresh, sandboxed engine is
//! created per execution to ensure:
//! - Tenant isolation (no shared state between executions)
//! - Resource limits (operations, stack depth, string/array/map sizes)
//! - No file system or network access

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rhai::{Dynamic, Engine, EvalAltResult, Scope};
use tracing::{debug, info, warn};

use crate::lookup::LookupTables;

/// Default maximum number of operations in the engine.
const DEFAULT_MAX_OPERATIONS: u64 = 100_000;

/// Default maximum call stack depth.
const DEFAULT_MAX_CALL_STACK_DEPTH: usize = 64;

/// Default maximum string size in bytes.
const DEFAULT_MAX_STRING_SIZE: usize = 65536;

/// Default maximum array size.
const DEFAULT_MAX_ARRAY_SIZE: usize = 10_000;

/// Default maximum map size.
const DEFAULT_MAX_MAP_SIZE: usize = 10_000;

/// Default wall-clock execution deadline in milliseconds.
const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Default cap on the serialized size of a script's return value.
const DEFAULT_MAX_OUTPUT_BYTES: usize = 262_144;

/// Typed failure returned by the sandbox.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SandboxError {
    /// Script failed to parse.
    #[error("compilation error: {message}")]
    Compile { message: String },

    /// Script raised a runtime error or threw a value. The message carries
    /// the original thrown value.
    #[error("runtime error: {message}")]
    Runtime { message: String },

    /// Script exceeded its wall-clock deadline or operation budget.
    #[error("script execution exceeded {timeout_ms}ms deadline")]
    Timeout { timeout_ms: u64 },

    /// Script exceeded a data or output size cap.
    #[error("script limit exceeded: {message}")]
    LimitExceeded { message: String },
}

impl SandboxError {
    /// Get a machine-readable error code for classification.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            SandboxError::Compile { .. } => "SCRIPT_COMPILE_ERROR",
            SandboxError::Runtime { .. } => "SCRIPT_RUNTIME_ERROR",
            SandboxError::Timeout { .. } => "SANDBOX_TIMEOUT",
            SandboxError::LimitExceeded { .. } => "SANDBOX_LIMIT",
        }
    }
}

/// Configuration for the script sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum number of operations before termination.
    pub max_operations: u64,
    /// Maximum call stack depth.
    pub max_call_stack_depth: usize,
    /// Maximum string size in bytes.
    pub max_string_size: usize,
    /// Maximum array size.
    pub max_array_size: usize,
    /// Maximum map size.
    pub max_map_size: usize,
    /// Wall-clock execution deadline in milliseconds.
    pub timeout_ms: u64,
    /// Maximum serialized size of the script's return value.
    pub max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_operations: DEFAULT_MAX_OPERATIONS,
            max_call_stack_depth: DEFAULT_MAX_CALL_STACK_DEPTH,
            max_string_size: DEFAULT_MAX_STRING_SIZE,
            max_array_size: DEFAULT_MAX_ARRAY_SIZE,
            max_map_size: DEFAULT_MAX_MAP_SIZE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// Variables and capabilities bound into one script invocation.
///
/// Globals are copied into a fresh scope per call; nothing leaks between
/// concurrent invocations.
#[derive(Debug, Clone, Default)]
pub struct ScriptGlobals {
    vars: BTreeMap<String, serde_json::Value>,
    lookups: Option<Arc<LookupTables>>,
}

impl ScriptGlobals {
    /// Create an empty set of globals.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a JSON value as a scope variable.
    #[must_use]
    pub fn with_var(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.vars.insert(name.into(), value);
        self
    }

    /// Expose lookup tables to the script via `lookup()` / `reverse_lookup()`.
    #[must_use]
    pub fn with_lookups(mut self, lookups: Arc<LookupTables>) -> Self {
        self.lookups = Some(lookups);
        self
    }
}

/// A syntax diagnostic from script validation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScriptDiagnostic {
    /// Line number of the error (if available).
    pub line: Option<usize>,
    /// Column of the error (if available).
    pub column: Option<usize>,
    /// Error message.
    pub message: String,
}

/// Sandboxed Rhai script executor, reused by the transformer and scheduler.
///
/// The sandbox itself is stateless; every call builds its own engine and
/// scope from [`ScriptGlobals`].
pub struct ScriptSandbox {
    config: SandboxConfig,
}

impl ScriptSandbox {
    /// Create a new sandbox with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: SandboxConfig::default(),
        }
    }

    /// Create a new sandbox with custom limits.
    #[must_use]
    pub fn with_config(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// The configured wall-clock deadline.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    /// Create a sandboxed engine with security constraints applied.
    fn create_engine(&self, globals: &ScriptGlobals) -> Engine {
        let mut engine = Engine::new();

        // Resource limits for the sandbox
        engine.set_max_operations(self.config.max_operations);
        engine.set_max_call_levels(self.config.max_call_stack_depth);
        engine.set_max_string_size(self.config.max_string_size);
        engine.set_max_array_size(self.config.max_array_size);
        engine.set_max_map_size(self.config.max_map_size);

        // Loops allowed but bounded by max_operations
        engine.set_allow_looping(true);
        engine.set_strict_variables(true);

        // Wall-clock deadline, checked on every engine progress tick
        let deadline = Instant::now() + Duration::from_millis(self.config.timeout_ms);
        engine.on_progress(move |_| {
            if Instant::now() >= deadline {
                Some(Dynamic::UNIT)
            } else {
                None
            }
        });

        // Host logging functions available to scripts
        engine.register_fn("log_info", |msg: &str| {
            info!(script_log = %msg, "script log");
        });
        engine.register_fn("log_warn", |msg: &str| {
            warn!(script_log = %msg, "script warning");
        });
        engine.register_fn("log_debug", |msg: &str| {
            debug!(script_log = %msg, "script debug");
        });

        // Lookup capability. Fails closed: a missing mapping returns unit,
        // never raises.
        if let Some(ref lookups) = globals.lookups {
            let forward = lookups.clone();
            engine.register_fn("lookup", move |table: &str, code: &str| -> Dynamic {
                match forward.resolve(table, code, None) {
                    Some(target) => target.into(),
                    None => Dynamic::UNIT,
                }
            });

            let forward_scoped = lookups.clone();
            engine.register_fn(
                "lookup",
                move |table: &str, code: &str, org_unit: &str| -> Dynamic {
                    match forward_scoped.resolve(table, code, Some(org_unit)) {
                        Some(target) => target.into(),
                        None => Dynamic::UNIT,
                    }
                },
            );

            let reverse = lookups.clone();
            engine.register_fn("reverse_lookup", move |table: &str, code: &str| -> Dynamic {
                match reverse.resolve_reverse(table, code, None) {
                    Some(source) => source.into(),
                    None => Dynamic::UNIT,
                }
            });

            let reverse_scoped = lookups.clone();
            engine.register_fn(
                "reverse_lookup",
                move |table: &str, code: &str, org_unit: &str| -> Dynamic {
                    match reverse_scoped.resolve_reverse(table, code, Some(org_unit)) {
                        Some(source) => source.into(),
                        None => Dynamic::UNIT,
                    }
                },
            );
        }

        engine
    }

    /// Build a scope from the bound globals.
    fn build_scope(globals: &ScriptGlobals) -> Scope<'static> {
        let mut scope = Scope::new();

        for (name, value) in &globals.vars {
            match rhai::serde::to_dynamic(value) {
                Ok(dynamic) => {
                    scope.push(name.clone(), dynamic);
                }
                Err(e) => {
                    warn!(var = %name, error = %e, "Failed to bind script global");
                }
            }
        }

        scope
    }

    /// Validate a script for syntax errors without executing it.
    #[must_use]
    pub fn validate(&self, script: &str) -> Vec<ScriptDiagnostic> {
        let engine = self.create_engine(&ScriptGlobals::default());
        match engine.compile(script) {
            Ok(_) => vec![],
            Err(e) => vec![ScriptDiagnostic {
                line: e.position().line(),
                column: e.position().position(),
                message: e.to_string(),
            }],
        }
    }

    /// Execute a script against the given globals and return its value as
    /// JSON.
    ///
    /// The script's final expression is the return value. Any thrown value or
    /// runtime error becomes [`SandboxError::Runtime`] carrying the original
    /// message; deadline/operation exhaustion becomes [`SandboxError::Timeout`];
    /// data size violations become [`SandboxError::LimitExceeded`].
    pub fn run(
        &self,
        script: &str,
        globals: &ScriptGlobals,
    ) -> Result<serde_json::Value, SandboxError> {
        let start = Instant::now();
        let engine = self.create_engine(globals);

        // Scope must exist before compilation so strict_variables can see
        // the bound globals.
        let mut scope = Self::build_scope(globals);

        let ast = engine
            .compile_with_scope(&scope, script)
            .map_err(|e| SandboxError::Compile {
                message: e.to_string(),
            })?;

        let result = engine.eval_ast_with_scope::<Dynamic>(&mut scope, &ast);
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(value) => {
                let json: serde_json::Value =
                    rhai::serde::from_dynamic(&value).map_err(|e| SandboxError::Runtime {
                        message: format!("script returned a non-JSON value: {e}"),
                    })?;

                let serialized_len = serde_json::to_vec(&json).map(|b| b.len()).unwrap_or(0);
                if serialized_len > self.config.max_output_bytes {
                    return Err(SandboxError::LimitExceeded {
                        message: format!(
                            "script output is {serialized_len} bytes (limit {})",
                            self.config.max_output_bytes
                        ),
                    });
                }

                debug!(
                    duration_ms = duration_ms,
                    output_bytes = serialized_len,
                    "Script executed successfully"
                );
                Ok(json)
            }
            Err(e) => Err(self.classify_eval_error(*e, duration_ms)),
        }
    }

    /// Map an engine error onto the sandbox taxonomy.
    fn classify_eval_error(&self, error: EvalAltResult, duration_ms: u64) -> SandboxError {
        match error {
            EvalAltResult::ErrorTerminated(_, _) | EvalAltResult::ErrorTooManyOperations(_) => {
                warn!(
                    duration_ms = duration_ms,
                    timeout_ms = self.config.timeout_ms,
                    "Script execution exceeded its budget"
                );
                SandboxError::Timeout {
                    timeout_ms: self.config.timeout_ms,
                }
            }
            EvalAltResult::ErrorDataTooLarge(message, _) => {
                SandboxError::LimitExceeded { message }
            }
            // A `throw` from the script: preserve the thrown value verbatim.
            EvalAltResult::ErrorRuntime(value, _) => SandboxError::Runtime {
                message: value.to_string(),
            },
            other => SandboxError::Runtime {
                message: other.to_string(),
            },
        }
    }
}

impl Default for ScriptSandbox {
    fn default() -> Self {
        Self::new()
    }
}
