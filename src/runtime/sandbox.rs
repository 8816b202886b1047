/// Script sandbox
///
/// Runs user-authored Lua against an explicit set of JSON bindings. Every call
/// gets its own interpreter on the blocking pool, a read-only base environment
/// built from the capability allow-list, an instruction budget and a heap
/// ceiling. Faults of any kind come back as `AppError::Script`.

use crate::{
    config::ExecutionConfig,
    error::{AppError, AppResult},
    runtime::{capabilities, databases::ScriptDatabases},
};
use mlua::{HookTriggers, Lua, LuaOptions, StdLib, VmState};
use serde_json::{Map, Value};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

/// VM instructions between two budget checks
const HOOK_GRANULARITY: u32 = 1_000;

/// Deepest table nesting converted back to JSON
const MAX_DEPTH: usize = 64;

/// Limits and toggles applied to each sandbox call
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    pub instruction_limit: u64,
    pub memory_limit_bytes: usize,
    pub allow_http: bool,
    pub http_timeout: Duration,
}

impl From<&ExecutionConfig> for SandboxLimits {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            instruction_limit: config.instruction_limit,
            memory_limit_bytes: config.memory_limit_bytes,
            allow_http: config.allow_http,
            http_timeout: Duration::from_secs(config.http_timeout_secs),
        }
    }
}

/// Output bindings a script assigned; unassigned ones stay `None`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptOutputs {
    pub next_node: Option<Value>,
    pub response: Option<Value>,
    pub result: Option<Value>,
    pub data: Option<Value>,
}

impl ScriptOutputs {
    /// Assigned outputs as a JSON object, for traces
    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        let outputs = [
            ("next_node", &self.next_node),
            ("response", &self.response),
            ("result", &self.result),
            ("data", &self.data),
        ];
        for (name, value) in outputs {
            if let Some(value) = value {
                object.insert(name.to_string(), value.clone());
            }
        }
        Value::Object(object)
    }
}

/// Re-entrant Lua executor
///
/// Holds no interpreter state; clones are cheap and calls never share a VM.
#[derive(Debug, Clone)]
pub struct ScriptSandbox {
    limits: SandboxLimits,
    databases: ScriptDatabases,
}

impl ScriptSandbox {
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits, databases: ScriptDatabases::default() }
    }

    /// Expose `databases` to scripts through the `db` capability
    pub fn with_databases(mut self, databases: ScriptDatabases) -> Self {
        self.databases = databases;
        self
    }

    /// Run `code` with `bindings` injected as globals
    ///
    /// The interpreter runs on tokio's blocking pool so long scripts never stall
    /// the async workers. A panic on that thread is reported as a script fault.
    pub async fn run(&self, code: &str, bindings: Map<String, Value>) -> AppResult<ScriptOutputs> {
        let code = code.to_string();
        let limits = self.limits.clone();
        let databases = self.databases.clone();

        match tokio::task::spawn_blocking(move || execute(&limits, &databases, &code, bindings)).await {
            Ok(outcome) => outcome,
            Err(join_error) => {
                let message = if join_error.is_panic() {
                    panic_message(join_error.into_panic())
                } else {
                    "script task was cancelled".to_string()
                };
                tracing::error!("❌ Script runtime panicked: {}", message);
                Err(AppError::script(format!("script runtime panicked: {}", message)))
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn script_error(err: mlua::Error) -> AppError {
    match err {
        mlua::Error::MemoryError(_) => AppError::script("script exceeded its memory limit"),
        other => AppError::script(other.to_string()),
    }
}

/// Synchronous body of `ScriptSandbox::run`
fn execute(
    limits: &SandboxLimits,
    databases: &ScriptDatabases,
    code: &str,
    bindings: Map<String, Value>,
) -> AppResult<ScriptOutputs> {
    let lua = Lua::new_with(
        StdLib::STRING | StdLib::TABLE | StdLib::MATH | StdLib::UTF8,
        LuaOptions::new(),
    )
    .map_err(script_error)?;

    lua.set_memory_limit(limits.memory_limit_bytes).map_err(script_error)?;
    install_instruction_budget(&lua, limits.instruction_limit);

    let base = capabilities::base_environment(&lua, limits, databases).map_err(script_error)?;
    let env = lua.create_table().map_err(script_error)?;
    let meta = lua.create_table().map_err(script_error)?;
    meta.set("__index", base).map_err(script_error)?;
    // A fresh table has no protected metatable
    let _ = env.set_metatable(Some(meta));

    let mut injected_data = mlua::Value::Nil;
    for (name, value) in &bindings {
        let value = json_to_lua(&lua, value).map_err(script_error)?;
        if name == "data" {
            injected_data = value.clone();
        }
        env.raw_set(name.as_str(), value).map_err(script_error)?;
    }

    lua.load(code)
        .set_name("=script")
        .set_environment(env.clone())
        .exec()
        .map_err(script_error)?;

    collect_outputs(&env, &injected_data, bindings.get("data"))
}

/// Abort the script once it has run `limit` VM instructions
fn install_instruction_budget(lua: &Lua, limit: u64) {
    let executed = Arc::new(AtomicU64::new(0));
    let triggers = HookTriggers::new().every_nth_instruction(HOOK_GRANULARITY);

    let _ = lua.set_hook(triggers, move |_lua, _debug| {
        let total = executed.fetch_add(u64::from(HOOK_GRANULARITY), Ordering::Relaxed)
            + u64::from(HOOK_GRANULARITY);
        if total > limit {
            Err(mlua::Error::runtime(format!(
                "instruction budget of {} exhausted",
                limit
            )))
        } else {
            Ok(VmState::Continue)
        }
    });
}

/// Read back the output bindings the script assigned
///
/// `data` counts as assigned when it is bound to a different Lua value than the
/// injected one, or when the injected table was mutated in place.
fn collect_outputs(
    env: &mlua::Table,
    injected: &mlua::Value,
    injected_json: Option<&Value>,
) -> AppResult<ScriptOutputs> {
    let read = |name: &str| -> AppResult<Option<Value>> {
        let value: mlua::Value = env.raw_get(name).map_err(script_error)?;
        match value {
            mlua::Value::Nil => Ok(None),
            other => lua_to_json(other).map(Some).map_err(script_error),
        }
    };

    let bound: mlua::Value = env.raw_get("data").map_err(script_error)?;
    let data = match &bound {
        mlua::Value::Nil => None,
        // Raw equality: same table reference, or same primitive
        same if same == injected => {
            let current = lua_to_json(same.clone()).map_err(script_error)?;
            match (same, injected_json) {
                (mlua::Value::Table(_), Some(original)) if &current != original => Some(current),
                _ => None,
            }
        }
        other => Some(lua_to_json(other.clone()).map_err(script_error)?),
    };

    Ok(ScriptOutputs {
        next_node: read("next_node")?,
        response: read("response")?,
        result: read("result")?,
        data,
    })
}

/// Convert a JSON value into a Lua value; `null` becomes `nil`
pub(crate) fn json_to_lua(lua: &Lua, value: &Value) -> mlua::Result<mlua::Value> {
    match value {
        Value::Null => Ok(mlua::Value::Nil),
        Value::Bool(b) => Ok(mlua::Value::Boolean(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(mlua::Value::Integer(i)),
            None => Ok(mlua::Value::Number(n.as_f64().unwrap_or(f64::NAN))),
        },
        Value::String(s) => Ok(mlua::Value::String(lua.create_string(s)?)),
        Value::Array(items) => {
            let table = lua.create_table_with_capacity(items.len(), 0)?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set(i + 1, json_to_lua(lua, item)?)?;
            }
            Ok(mlua::Value::Table(table))
        }
        Value::Object(map) => {
            let table = lua.create_table_with_capacity(0, map.len())?;
            for (key, item) in map {
                table.raw_set(key.as_str(), json_to_lua(lua, item)?)?;
            }
            Ok(mlua::Value::Table(table))
        }
    }
}

/// Convert a Lua value back into JSON
///
/// Tables whose keys are exactly `1..n` become arrays, anything else an object.
/// Functions, threads and userdata become `null`.
pub(crate) fn lua_to_json(value: mlua::Value) -> mlua::Result<Value> {
    lua_to_json_at(value, 0)
}

fn lua_to_json_at(value: mlua::Value, depth: usize) -> mlua::Result<Value> {
    match value {
        mlua::Value::Nil => Ok(Value::Null),
        mlua::Value::Boolean(b) => Ok(Value::Bool(b)),
        mlua::Value::Integer(i) => Ok(Value::from(i)),
        mlua::Value::Number(f) => Ok(serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)),
        mlua::Value::String(s) => Ok(Value::String(s.to_string_lossy().to_string())),
        mlua::Value::Table(table) => {
            if depth >= MAX_DEPTH {
                return Err(mlua::Error::runtime(
                    "table nesting too deep to convert (cyclic table?)",
                ));
            }

            let mut count = 0usize;
            let mut max_index = 0usize;
            let mut is_array = true;
            for pair in table.pairs::<mlua::Value, mlua::Value>() {
                let (key, _) = pair?;
                count += 1;
                match key {
                    mlua::Value::Integer(i) if i > 0 => max_index = max_index.max(i as usize),
                    _ => is_array = false,
                }
            }

            if is_array && count > 0 && count == max_index {
                let mut items = Vec::with_capacity(count);
                for i in 1..=max_index {
                    items.push(lua_to_json_at(table.raw_get(i)?, depth + 1)?);
                }
                return Ok(Value::Array(items));
            }

            let mut object = Map::new();
            for pair in table.pairs::<mlua::Value, mlua::Value>() {
                let (key, item) = pair?;
                let key = match key {
                    mlua::Value::String(s) => s.to_string_lossy().to_string(),
                    mlua::Value::Integer(i) => i.to_string(),
                    mlua::Value::Number(f) => f.to_string(),
                    mlua::Value::Boolean(b) => b.to_string(),
                    _ => continue,
                };
                object.insert(key, lua_to_json_at(item, depth + 1)?);
            }
            Ok(Value::Object(object))
        }
        _ => Ok(Value::Null),
    }
}
