/// Capability allow-list for sandboxed scripts
///
/// Builds the read-only base environment every script resolves globals through.
/// Only what is listed here is reachable; the interpreter's own globals table
/// (with `load`, `dofile`, `collectgarbage` and friends) is never exposed.

use crate::runtime::{
    databases::{self, ScriptDatabases},
    sandbox::{json_to_lua, lua_to_json, SandboxLimits},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use mlua::{Lua, Table, Variadic};
use regex::Regex;
use sha2::{Digest, Sha256, Sha512};
use sqlx::sqlite::SqlitePool;
use std::fmt::Write as _;
use std::{future::Future, time::Duration};

/// Lua base functions copied into the environment
pub const BASE_FUNCTIONS: [&str; 11] = [
    "assert", "error", "ipairs", "next", "pairs", "pcall", "select", "tonumber", "tostring",
    "type", "xpcall",
];

/// Standard libraries copied into the environment
pub const LIBRARIES: [&str; 4] = ["string", "table", "math", "utf8"];

/// Build the base environment for one interpreter
pub fn base_environment(lua: &Lua, limits: &SandboxLimits, databases: &ScriptDatabases) -> mlua::Result<Table> {
    let globals = lua.globals();
    let base = lua.create_table()?;

    for name in BASE_FUNCTIONS.iter().chain(LIBRARIES.iter()) {
        let value: mlua::Value = globals.get(*name)?;
        base.set(*name, value)?;
    }

    base.set("print", print_function(lua)?)?;
    base.set("log", log_table(lua)?)?;
    base.set("json", json_table(lua)?)?;
    base.set("time", time_table(lua)?)?;
    base.set("uuid", uuid_table(lua)?)?;
    base.set("hash", hash_table(lua)?)?;
    base.set("base64", base64_table(lua)?)?;
    base.set("regex", regex_table(lua)?)?;
    base.set("collections", collections_table(lua)?)?;
    if limits.allow_http {
        base.set("http", http_table(lua, limits.http_timeout)?)?;
    }
    if let Some(default) = databases.default_database() {
        base.set("db", db_table(lua, default.pool.clone())?)?;
    }
    for database in databases.iter() {
        if base.contains_key(database.name.as_str())? {
            if database.name != "db" {
                tracing::warn!("⚠️ Script database '{}' clashes with a built-in name; not bound", database.name);
            }
            continue;
        }
        base.set(database.name.as_str(), db_table(lua, database.pool.clone())?)?;
    }

    Ok(base)
}

/// Render values the way `print` shows them
fn display_values(values: Variadic<mlua::Value>) -> String {
    let mut parts = Vec::with_capacity(values.len());
    for value in values {
        let part = match value {
            mlua::Value::Nil => "nil".to_string(),
            mlua::Value::String(s) => s.to_string_lossy().to_string(),
            mlua::Value::Table(_) => match lua_to_json(value) {
                Ok(json) => json.to_string(),
                Err(_) => "table".to_string(),
            },
            other => match lua_to_json(other) {
                Ok(serde_json::Value::Null) => "userdata".to_string(),
                Ok(json) => json.to_string(),
                Err(_) => "?".to_string(),
            },
        };
        parts.push(part);
    }
    parts.join("\t")
}

fn print_function(lua: &Lua) -> mlua::Result<mlua::Function> {
    lua.create_function(|_, values: Variadic<mlua::Value>| {
        tracing::info!(target: "flowgate::script", "{}", display_values(values));
        Ok(())
    })
}

fn log_table(lua: &Lua) -> mlua::Result<Table> {
    let log = lua.create_table()?;
    log.set(
        "debug",
        lua.create_function(|_, values: Variadic<mlua::Value>| {
            tracing::debug!(target: "flowgate::script", "{}", display_values(values));
            Ok(())
        })?,
    )?;
    log.set(
        "info",
        lua.create_function(|_, values: Variadic<mlua::Value>| {
            tracing::info!(target: "flowgate::script", "{}", display_values(values));
            Ok(())
        })?,
    )?;
    log.set(
        "warn",
        lua.create_function(|_, values: Variadic<mlua::Value>| {
            tracing::warn!(target: "flowgate::script", "{}", display_values(values));
            Ok(())
        })?,
    )?;
    log.set(
        "error",
        lua.create_function(|_, values: Variadic<mlua::Value>| {
            tracing::error!(target: "flowgate::script", "{}", display_values(values));
            Ok(())
        })?,
    )?;
    Ok(log)
}

fn json_table(lua: &Lua) -> mlua::Result<Table> {
    let json = lua.create_table()?;
    json.set(
        "encode",
        lua.create_function(|_, value: mlua::Value| {
            serde_json::to_string(&lua_to_json(value)?).map_err(mlua::Error::external)
        })?,
    )?;
    json.set(
        "decode",
        lua.create_function(|lua, text: String| {
            let value: serde_json::Value = serde_json::from_str(&text)
                .map_err(|e| mlua::Error::runtime(format!("json.decode: {}", e)))?;
            json_to_lua(lua, &value)
        })?,
    )?;
    Ok(json)
}

fn time_table(lua: &Lua) -> mlua::Result<Table> {
    let time = lua.create_table()?;
    time.set("now", lua.create_function(|_, ()| Ok(chrono::Utc::now().to_rfc3339()))?)?;
    time.set("unix", lua.create_function(|_, ()| Ok(chrono::Utc::now().timestamp()))?)?;
    time.set(
        "unix_ms",
        lua.create_function(|_, ()| Ok(chrono::Utc::now().timestamp_millis()))?,
    )?;
    time.set(
        "format",
        lua.create_function(|_, format: String| {
            let mut out = String::new();
            write!(out, "{}", chrono::Utc::now().format(&format))
                .map_err(|_| mlua::Error::runtime(format!("time.format: invalid format '{}'", format)))?;
            Ok(out)
        })?,
    )?;
    Ok(time)
}

fn uuid_table(lua: &Lua) -> mlua::Result<Table> {
    let uuid = lua.create_table()?;
    uuid.set("v4", lua.create_function(|_, ()| Ok(uuid::Uuid::new_v4().to_string()))?)?;
    Ok(uuid)
}

fn hash_table(lua: &Lua) -> mlua::Result<Table> {
    let hash = lua.create_table()?;
    hash.set(
        "sha256",
        lua.create_function(|_, input: mlua::String| Ok(hex::encode(Sha256::digest(&*input.as_bytes()))))?,
    )?;
    hash.set(
        "sha512",
        lua.create_function(|_, input: mlua::String| Ok(hex::encode(Sha512::digest(&*input.as_bytes()))))?,
    )?;
    Ok(hash)
}

fn base64_table(lua: &Lua) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    table.set(
        "encode",
        lua.create_function(|_, input: mlua::String| Ok(STANDARD.encode(&*input.as_bytes())))?,
    )?;
    table.set(
        "decode",
        lua.create_function(|lua, input: String| {
            let bytes = STANDARD
                .decode(input.trim())
                .map_err(|e| mlua::Error::runtime(format!("base64.decode: {}", e)))?;
            lua.create_string(bytes)
        })?,
    )?;
    Ok(table)
}

fn compile(pattern: &str) -> mlua::Result<Regex> {
    Regex::new(pattern).map_err(|e| mlua::Error::runtime(format!("regex: {}", e)))
}

fn regex_table(lua: &Lua) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    table.set(
        "is_match",
        lua.create_function(|_, (pattern, text): (String, String)| Ok(compile(&pattern)?.is_match(&text)))?,
    )?;
    table.set(
        "find",
        lua.create_function(|_, (pattern, text): (String, String)| {
            Ok(compile(&pattern)?.find(&text).map(|m| m.as_str().to_string()))
        })?,
    )?;
    table.set(
        "captures",
        lua.create_function(|lua, (pattern, text): (String, String)| {
            let re = compile(&pattern)?;
            let Some(caps) = re.captures(&text) else {
                return Ok(mlua::Value::Nil);
            };

            // [1] is the whole match, [i + 1] is group i; named groups also by name
            let result = lua.create_table()?;
            for (i, group) in caps.iter().enumerate() {
                if let Some(group) = group {
                    result.raw_set(i + 1, group.as_str())?;
                }
            }
            for name in re.capture_names().flatten() {
                if let Some(group) = caps.name(name) {
                    result.raw_set(name, group.as_str())?;
                }
            }
            Ok(mlua::Value::Table(result))
        })?,
    )?;
    table.set(
        "replace",
        lua.create_function(|_, (pattern, text, replacement): (String, String, String)| {
            Ok(compile(&pattern)?.replace_all(&text, replacement.as_str()).into_owned())
        })?,
    )?;
    Ok(table)
}

fn collections_table(lua: &Lua) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    table.set(
        "keys",
        lua.create_function(|lua, input: Table| {
            let mut keys = Vec::new();
            for pair in input.pairs::<mlua::Value, mlua::Value>() {
                keys.push(pair?.0);
            }
            sort_for_output(&mut keys);
            lua.create_sequence_from(keys)
        })?,
    )?;
    table.set(
        "values",
        lua.create_function(|lua, input: Table| {
            let mut entries = Vec::new();
            for pair in input.pairs::<mlua::Value, mlua::Value>() {
                entries.push(pair?);
            }
            entries.sort_by(|a, b| sort_key(&a.0).cmp(&sort_key(&b.0)));
            lua.create_sequence_from(entries.into_iter().map(|(_, value)| value))
        })?,
    )?;
    table.set(
        "merge",
        lua.create_function(|lua, (left, right): (Table, Table)| {
            let merged = lua.create_table()?;
            for source in [left, right] {
                for pair in source.pairs::<mlua::Value, mlua::Value>() {
                    let (key, value) = pair?;
                    merged.raw_set(key, value)?;
                }
            }
            Ok(merged)
        })?,
    )?;
    table.set(
        "contains",
        lua.create_function(|_, (input, needle): (Table, mlua::Value)| {
            let needle = lua_to_json(needle)?;
            for pair in input.pairs::<mlua::Value, mlua::Value>() {
                if lua_to_json(pair?.1)? == needle {
                    return Ok(true);
                }
            }
            Ok(false)
        })?,
    )?;
    Ok(table)
}

/// Integers first in numeric order, then everything else by text
fn sort_key(value: &mlua::Value) -> (u8, i64, String) {
    match value {
        mlua::Value::Integer(i) => (0, *i, String::new()),
        mlua::Value::String(s) => (1, 0, s.to_string_lossy().to_string()),
        other => (2, 0, format!("{:?}", other)),
    }
}

fn sort_for_output(values: &mut [mlua::Value]) {
    values.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
}

fn http_table(lua: &Lua, timeout: Duration) -> mlua::Result<Table> {
    let http = lua.create_table()?;
    http.set(
        "get",
        lua.create_function(move |lua, (url, headers): (String, Option<Table>)| {
            let client = http_client(timeout)?;
            let request = apply_headers(client.get(&url), headers)?;
            http_response(lua, request)
        })?,
    )?;
    http.set(
        "post",
        lua.create_function(
            move |lua, (url, body, headers): (String, mlua::Value, Option<Table>)| {
                let client = http_client(timeout)?;
                let mut request = apply_headers(client.post(&url), headers)?;
                request = match body {
                    mlua::Value::Nil => request,
                    mlua::Value::String(s) => request.body(s.as_bytes().to_vec()),
                    other => request.json(&lua_to_json(other)?),
                };
                http_response(lua, request)
            },
        )?,
    )?;
    Ok(http)
}

fn http_client(timeout: Duration) -> mlua::Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(mlua::Error::external)
}

fn apply_headers(
    mut request: reqwest::blocking::RequestBuilder,
    headers: Option<Table>,
) -> mlua::Result<reqwest::blocking::RequestBuilder> {
    if let Some(headers) = headers {
        for pair in headers.pairs::<String, String>() {
            let (name, value) = pair?;
            request = request.header(name, value);
        }
    }
    Ok(request)
}

/// `{status, body, json?}` for a completed request
fn http_response(lua: &Lua, request: reqwest::blocking::RequestBuilder) -> mlua::Result<Table> {
    let response = request
        .send()
        .map_err(|e| mlua::Error::runtime(format!("http: {}", e)))?;
    let status = response.status().as_u16();
    let body = response
        .text()
        .map_err(|e| mlua::Error::runtime(format!("http: {}", e)))?;

    tracing::debug!(target: "flowgate::script", "🌐 HTTP call finished with status {}", status);

    let result = lua.create_table()?;
    result.set("status", status)?;
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(&body) {
        result.set("json", json_to_lua(lua, &json)?)?;
    }
    result.set("body", body)?;
    Ok(result)
}

/// `query(sql, params)` returns rows, `execute(sql, params)` the affected count
fn db_table(lua: &Lua, pool: SqlitePool) -> mlua::Result<Table> {
    let db = lua.create_table()?;
    let query_pool = pool.clone();
    db.set(
        "query",
        lua.create_function(move |lua, (sql, params): (String, Option<mlua::Value>)| {
            let params = statement_params(params)?;
            let rows = block_on_runtime(databases::query(&query_pool, &sql, &params))?;
            json_to_lua(lua, &serde_json::Value::Array(rows))
        })?,
    )?;
    db.set(
        "execute",
        lua.create_function(move |_, (sql, params): (String, Option<mlua::Value>)| {
            let params = statement_params(params)?;
            block_on_runtime(databases::execute(&pool, &sql, &params))
        })?,
    )?;
    Ok(db)
}

/// Positional parameters from a Lua array; an empty table converts to `{}`
fn statement_params(params: Option<mlua::Value>) -> mlua::Result<Vec<serde_json::Value>> {
    match params.map(lua_to_json).transpose()? {
        None | Some(serde_json::Value::Null) => Ok(Vec::new()),
        Some(serde_json::Value::Array(items)) => Ok(items),
        Some(serde_json::Value::Object(map)) if map.is_empty() => Ok(Vec::new()),
        Some(other) => Err(mlua::Error::runtime(format!("db: params must be an array, got {}", other))),
    }
}

/// Drive a storage future from the sandbox's blocking thread
fn block_on_runtime<T>(work: impl Future<Output = anyhow::Result<T>>) -> mlua::Result<T> {
    let handle = tokio::runtime::Handle::try_current()
        .map_err(|_| mlua::Error::runtime("db: no async runtime available"))?;
    handle
        .block_on(work)
        .map_err(|e| mlua::Error::runtime(format!("db: {:#}", e)))
}
