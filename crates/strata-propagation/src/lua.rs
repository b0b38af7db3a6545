//! Embedded Lua object bridge for declaratively defined providers
//!
//! A provider registered from a definition file supplies a Lua script whose
//! `getObjects(namespace, name)` function returns the objects to propagate.
//! Each invocation runs in a fresh, isolated interpreter with exactly three
//! host functions in scope (`getObject`, `jsonEncode`, `base64Encode`), so
//! a script can fetch source-cluster objects and reshape them, but touches
//! nothing else in the host process.
//!
//! Lua has no exception model compatible with the host, so `getObject`
//! reports failures as a second return value (`nil, "<error>"`) in the
//! language's own idiom; faults inside the script surface through the
//! protected call as ordinary errors.

use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kube::api::{Api, DynamicObject};
use kube::Client;
use mlua::{Function, Lua, Table, Value as LuaValue};
use serde_json::{Map, Number, Value as Json};
use tracing::debug;

use strata_common::kube_utils::{api_resource_for_gvk, strip_export_metadata};
use strata_common::types::GvkRef;
use strata_common::{Error, Result};

use crate::{apply, PropagationConfig};

/// Well-known entrypoint a provider script must define
pub const ENTRYPOINT: &str = "getObjects";

/// Wall-clock budget for one script invocation
pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Instruction granularity of the in-interpreter deadline check
const HOOK_INSTRUCTION_INTERVAL: u32 = 10_000;

/// Marker raised by the deadline hook; recognized when mapping script faults
const DEADLINE_MESSAGE: &str = "script deadline exceeded";

// =============================================================================
// Value conversion (host <-> script)
// =============================================================================

/// Convert a host value into a script value
///
/// Numbers widen to Lua floats, so round-tripping very large integers is not
/// bit-exact (precision ends at 2^53). Lists become 1-based tables.
pub fn lua_from_json<'lua>(lua: &'lua Lua, value: &Json) -> mlua::Result<LuaValue<'lua>> {
    match value {
        Json::Null => Ok(LuaValue::Nil),
        Json::Bool(b) => Ok(LuaValue::Boolean(*b)),
        Json::Number(n) => Ok(LuaValue::Number(n.as_f64().unwrap_or_default())),
        Json::String(s) => Ok(LuaValue::String(lua.create_string(s)?)),
        Json::Array(items) => {
            let table = lua.create_table()?;
            for (i, item) in items.iter().enumerate() {
                table.set(i + 1, lua_from_json(lua, item)?)?;
            }
            Ok(LuaValue::Table(table))
        }
        Json::Object(map) => {
            let table = lua.create_table()?;
            for (key, item) in map {
                table.set(key.as_str(), lua_from_json(lua, item)?)?;
            }
            Ok(LuaValue::Table(table))
        }
    }
}

/// Convert a script value back into a host value
///
/// Unsupported script kinds (functions, userdata, threads) convert to null
/// rather than erroring.
pub fn json_from_lua(value: &LuaValue) -> Json {
    match value {
        LuaValue::Nil => Json::Null,
        LuaValue::Boolean(b) => Json::Bool(*b),
        LuaValue::Integer(i) => Number::from_f64(*i as f64)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        LuaValue::Number(n) => Number::from_f64(*n).map(Json::Number).unwrap_or(Json::Null),
        LuaValue::String(s) => Json::String(s.to_string_lossy().to_string()),
        LuaValue::Table(table) => json_from_table(table),
        _ => Json::Null,
    }
}

/// Classify and convert a table
///
/// Lua has one table type for both lists and maps; a positive maximum
/// integer key classifies the table as a list. An empty table therefore
/// converts to an empty mapping, not an empty list.
fn json_from_table(table: &Table) -> Json {
    let mut max_index: i64 = 0;
    for pair in table.clone().pairs::<LuaValue, LuaValue>() {
        let Ok((key, _)) = pair else { continue };
        match key {
            LuaValue::Integer(i) if i > max_index => max_index = i,
            LuaValue::Number(n) if n.fract() == 0.0 && n > max_index as f64 => {
                max_index = n as i64
            }
            _ => {}
        }
    }

    if max_index > 0 {
        let mut items = Vec::with_capacity(max_index as usize);
        for i in 1..=max_index {
            let item: LuaValue = table.get(i).unwrap_or(LuaValue::Nil);
            items.push(json_from_lua(&item));
        }
        Json::Array(items)
    } else {
        let mut map = Map::new();
        for pair in table.clone().pairs::<LuaValue, LuaValue>() {
            let Ok((key, value)) = pair else { continue };
            let key = match key {
                LuaValue::String(s) => s.to_string_lossy().to_string(),
                LuaValue::Integer(i) => i.to_string(),
                LuaValue::Number(n) => n.to_string(),
                LuaValue::Boolean(b) => b.to_string(),
                _ => continue,
            };
            map.insert(key, json_from_lua(&value));
        }
        Json::Object(map)
    }
}

// =============================================================================
// Host functions
// =============================================================================

/// Install `jsonEncode` and `base64Encode` into the interpreter's globals
fn install_codecs(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();

    let json_encode = lua.create_function(|_, value: LuaValue| match value {
        LuaValue::Table(_) => serde_json::to_string(&json_from_lua(&value))
            .map_err(|e| mlua::Error::RuntimeError(format!("jsonEncode: {}", e))),
        _ => Err(mlua::Error::RuntimeError(
            "jsonEncode expects a table".to_string(),
        )),
    })?;
    globals.set("jsonEncode", json_encode)?;

    let base64_encode = lua.create_function(|_, input: mlua::String| {
        let bytes = input.as_bytes();
        if bytes.is_empty() {
            return Err(mlua::Error::RuntimeError(
                "base64Encode: empty input".to_string(),
            ));
        }
        Ok(STANDARD.encode(bytes))
    })?;
    globals.set("base64Encode", base64_encode)?;

    Ok(())
}

/// Fetch one generic object from the source cluster
async fn fetch_object(
    client: &Client,
    gvk: &GvkRef,
    name: &str,
    namespace: Option<&str>,
) -> Result<Json> {
    let ar = api_resource_for_gvk(gvk);
    let result = match namespace {
        Some(ns) => {
            let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), ns, &ar);
            api.get(name).await
        }
        None => {
            let api: Api<DynamicObject> = Api::all_with(client.clone(), &ar);
            api.get(name).await
        }
    };
    let obj = result.map_err(|e| {
        Error::resolution(&gvk.kind, name, namespace.unwrap_or_default(), e.to_string())
    })?;
    serde_json::to_value(&obj).map_err(|e| Error::serialization(e.to_string()))
}

/// Install `getObject(gvk, name, namespace)` into the interpreter's globals
///
/// Returns the object's structured content as a table, or `nil` plus an
/// error string on failure.
fn install_get_object(lua: &Lua, client: Client) -> mlua::Result<()> {
    let get_object = lua.create_async_function(
        move |lua, (gvk, name, namespace): (Table, String, Option<String>)| {
            let client = client.clone();
            async move {
                let group: String = gvk.get::<_, Option<String>>("group")?.unwrap_or_default();
                let version: String = gvk
                    .get::<_, Option<String>>("version")?
                    .unwrap_or_else(|| "v1".to_string());
                let kind: String = gvk.get::<_, Option<String>>("kind")?.unwrap_or_default();
                if kind.is_empty() {
                    return Ok((
                        LuaValue::Nil,
                        Some("getObject: gvk.kind is required".to_string()),
                    ));
                }

                let gvk_ref = GvkRef::new(group, version, kind);
                match fetch_object(&client, &gvk_ref, &name, namespace.as_deref()).await {
                    Ok(json) => Ok((lua_from_json(lua, &json)?, None)),
                    Err(e) => Ok((LuaValue::Nil, Some(e.to_string()))),
                }
            }
        },
    )?;
    lua.globals().set("getObject", get_object)?;
    Ok(())
}

// =============================================================================
// Script execution
// =============================================================================

fn map_script_error(err: mlua::Error, timeout: Duration) -> Error {
    let message = err.to_string();
    if message.contains(DEADLINE_MESSAGE) {
        Error::script_timeout(timeout)
    } else {
        Error::script(message)
    }
}

/// Load a script and run its entrypoint in an interpreter whose host
/// functions are already installed
async fn execute_entrypoint(
    lua: &Lua,
    namespace: &str,
    name: &str,
    script: &str,
    timeout: Duration,
) -> Result<Vec<Json>> {
    // The await-side timeout below covers scripts blocked on host calls;
    // this hook covers pure-CPU loops that never reach an await point.
    let deadline = Instant::now() + timeout;
    lua.set_hook(
        mlua::HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTION_INTERVAL),
        move |_lua, _debug| {
            if Instant::now() >= deadline {
                Err(mlua::Error::RuntimeError(DEADLINE_MESSAGE.to_string()))
            } else {
                Ok(())
            }
        },
    );

    // Top-level definitions only; the entrypoint runs separately below
    lua.load(script)
        .exec()
        .map_err(|e| map_script_error(e, timeout))?;

    let entry: Function = lua.globals().get(ENTRYPOINT).map_err(|_| {
        Error::script(format!("script does not define a {} function", ENTRYPOINT))
    })?;

    let result = tokio::time::timeout(
        timeout,
        entry.call_async::<_, LuaValue>((namespace.to_string(), name.to_string())),
    )
    .await
    .map_err(|_| Error::script_timeout(timeout))?
    .map_err(|e| map_script_error(e, timeout))?;

    objects_from_result(&result)
}

/// Interpret the entrypoint's return value as a batch of generic objects
fn objects_from_result(value: &LuaValue) -> Result<Vec<Json>> {
    let items = match json_from_lua(value) {
        Json::Array(items) => items,
        // The list/map heuristic converts an empty table to an empty
        // mapping; a script that found nothing to propagate is not an error
        Json::Object(map) if map.is_empty() => Vec::new(),
        _ => {
            return Err(Error::script(format!(
                "{} must return a list of objects",
                ENTRYPOINT
            )))
        }
    };

    let mut objects = Vec::with_capacity(items.len());
    for item in items {
        let has_kind = item
            .get("kind")
            .and_then(|v| v.as_str())
            .is_some_and(|s| !s.is_empty());
        let has_name = item
            .pointer("/metadata/name")
            .and_then(|v| v.as_str())
            .is_some_and(|s| !s.is_empty());
        if !has_kind || !has_name {
            // A malformed entry skips only itself, not the batch
            debug!("skipping script object without kind or metadata.name");
            continue;
        }
        objects.push(item);
    }
    Ok(objects)
}

/// Run a provider script's enumeration entrypoint against the source cluster
///
/// A fresh interpreter is created per invocation; no state survives between
/// calls. Execution is bounded by `timeout`; expiry surfaces as
/// [`Error::ScriptTimeout`], distinct from ordinary script faults.
pub async fn resolve_objects(
    client: &Client,
    namespace: &str,
    name: &str,
    script: &str,
    timeout: Duration,
) -> Result<Vec<Json>> {
    let lua = Lua::new();
    install_codecs(&lua).map_err(|e| Error::script(format!("installing host functions: {}", e)))?;
    install_get_object(&lua, client.clone())
        .map_err(|e| Error::script(format!("installing host functions: {}", e)))?;

    execute_entrypoint(&lua, namespace, name, script, timeout).await
}

/// Propagate script-enumerated objects into the managed cluster
///
/// The generic entrypoint for declaratively registered providers: run the
/// script against the source cluster, strip source-cluster metadata from the
/// returned objects, and apply them into the managed cluster.
pub async fn propagate_provider_objects(cfg: &PropagationConfig, script: &str) -> Result<()> {
    let mut objects = resolve_objects(
        &cfg.client,
        &cfg.cluster_namespace,
        &cfg.cluster_name,
        script,
        DEFAULT_SCRIPT_TIMEOUT,
    )
    .await?;

    for object in &mut objects {
        strip_export_metadata(object);
    }

    apply::apply_to_managed_cluster(cfg, &objects).await
}
