//! Lua 5.4 sandbox for TreeHouse scripts
//!
//! Every run gets a fresh interpreter with a whitelist-only environment:
//! core functions, `string`, `table`, and `math` without `random` /
//! `randomseed`. There is no `os`, `io`, `require`, `load` or `dofile`, and no
//! `pcall`, so a deadline abort cannot be swallowed by the script.
//!
//! Globals visible to the script:
//! - `payload`: the event payload
//! - `event`: `{ id, subject, correlation_id, causation_id }`
//! - `treehouse.retry(reason)` / `treehouse.reject(reason)`: return these to
//!   classify a failure
//!
//! The chunk's return value decides the output: `nil` emits nothing, a table
//! emits one payload, an array of tables emits one payload per element.

use mlua::{HookTriggers, Lua, LuaOptions, StdLib, Table, Value as LuaValue, VmState};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::treehouse::{Script, ScriptError, ScriptInput, ScriptLimits, ScriptOutput, ScriptRuntime};

/// Instructions between deadline checks
const HOOK_INTERVAL: u32 = 1_000;

/// Deepest table nesting converted back to JSON
const MAX_DEPTH: usize = 32;

/// Marker field set by `treehouse.retry` / `treehouse.reject`
const DIRECTIVE_KEY: &str = "__treehouse";

const CORE_FUNCTIONS: &[&str] = &[
    "tostring",
    "tonumber",
    "type",
    "pairs",
    "ipairs",
    "next",
    "select",
    "error",
    "assert",
    "rawget",
    "rawset",
    "rawlen",
    "rawequal",
    "setmetatable",
    "getmetatable",
];

const NOT_ABORTED: u8 = 0;
const ABORTED_DEADLINE: u8 = 1;
const ABORTED_BUDGET: u8 = 2;

#[derive(Debug, Clone, Copy, Default)]
pub struct LuaRuntime;

impl LuaRuntime {
    pub fn new() -> Self {
        Self
    }

    fn interpreter() -> Result<Lua, ScriptError> {
        Lua::new_with(
            StdLib::MATH | StdLib::STRING | StdLib::TABLE,
            LuaOptions::default(),
        )
        .map_err(|e| ScriptError::Runtime(e.to_string()))
    }
}

fn chunk_name(script: &Script) -> String {
    format!("={}", script.path)
}

impl ScriptRuntime for LuaRuntime {
    fn check(&self, script: &Script) -> Result<(), ScriptError> {
        let lua = Self::interpreter()?;
        lua.load(&*script.source)
            .set_name(chunk_name(script))
            .into_function()
            .map(|_| ())
            .map_err(|e| ScriptError::Compile(e.to_string()))
    }

    fn execute(
        &self,
        script: &Script,
        input: &ScriptInput,
        limits: &ScriptLimits,
    ) -> Result<ScriptOutput, ScriptError> {
        let lua = Self::interpreter()?;
        let env = build_env(&lua, input).map_err(|e| ScriptError::Runtime(e.to_string()))?;

        let chunk = lua
            .load(&*script.source)
            .set_name(chunk_name(script))
            .set_environment(env)
            .into_function()
            .map_err(|e| ScriptError::Compile(e.to_string()))?;

        if limits.max_memory > 0 {
            let used = lua.used_memory();
            lua.set_memory_limit(used.saturating_add(limits.max_memory))
                .map_err(|e| ScriptError::Runtime(e.to_string()))?;
        }

        let aborted = Arc::new(AtomicU8::new(NOT_ABORTED));
        let executed = Arc::new(AtomicU64::new(0));
        {
            let aborted = aborted.clone();
            let deadline = limits.deadline;
            let budget = limits.max_instructions;
            lua.set_hook(
                HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
                move |_lua, _debug| {
                    let count = executed.fetch_add(u64::from(HOOK_INTERVAL), Ordering::Relaxed)
                        + u64::from(HOOK_INTERVAL);
                    if Instant::now() >= deadline {
                        aborted.store(ABORTED_DEADLINE, Ordering::Relaxed);
                        return Err(mlua::Error::RuntimeError("deadline exceeded".into()));
                    }
                    if count > budget {
                        aborted.store(ABORTED_BUDGET, Ordering::Relaxed);
                        return Err(mlua::Error::RuntimeError(format!(
                            "instruction budget exceeded ({budget})"
                        )));
                    }
                    Ok(VmState::Continue)
                },
            );
        }

        let result = chunk.call::<LuaValue>(());
        lua.remove_hook();

        match aborted.load(Ordering::Relaxed) {
            ABORTED_DEADLINE => return Err(ScriptError::Timeout),
            ABORTED_BUDGET => return Err(ScriptError::BudgetExhausted),
            _ => {}
        }
        // A single long C call (string.rep, table.concat) never reaches the hook
        if Instant::now() >= limits.deadline {
            return Err(ScriptError::Timeout);
        }

        let value = result.map_err(|e| {
            if is_memory_error(&e) {
                ScriptError::MemoryExhausted(limits.max_memory)
            } else {
                ScriptError::Runtime(e.to_string())
            }
        })?;
        classify(value)
    }
}

fn is_memory_error(error: &mlua::Error) -> bool {
    match error {
        mlua::Error::MemoryError(_) => true,
        mlua::Error::CallbackError { cause, .. } => is_memory_error(cause),
        _ => false,
    }
}

fn build_env(lua: &Lua, input: &ScriptInput) -> mlua::Result<Table> {
    let env = lua.create_table()?;
    let globals = lua.globals();

    for name in CORE_FUNCTIONS {
        let value: LuaValue = globals.get(*name)?;
        if !value.is_nil() {
            env.set(*name, value)?;
        }
    }
    for lib in ["string", "table"] {
        env.set(lib, globals.get::<Table>(lib)?)?;
    }

    let math: Table = globals.get("math")?;
    let safe_math = lua.create_table()?;
    for pair in math.pairs::<String, LuaValue>() {
        let (name, value) = pair?;
        if name != "random" && name != "randomseed" {
            safe_math.set(name, value)?;
        }
    }
    env.set("math", safe_math)?;

    let treehouse = lua.create_table()?;
    treehouse.set(
        "retry",
        lua.create_function(|lua, reason: Option<String>| directive(lua, "retry", reason))?,
    )?;
    treehouse.set(
        "reject",
        lua.create_function(|lua, reason: Option<String>| directive(lua, "reject", reason))?,
    )?;
    env.set("treehouse", treehouse)?;

    env.set("payload", json_to_lua(lua, &input.payload)?)?;
    env.set("event", json_to_lua(lua, &input.event)?)?;

    Ok(env)
}

fn directive(lua: &Lua, kind: &str, reason: Option<String>) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    table.set(DIRECTIVE_KEY, kind)?;
    table.set("reason", reason.unwrap_or_else(|| format!("script requested {kind}")))?;
    Ok(table)
}

fn classify(value: LuaValue) -> Result<ScriptOutput, ScriptError> {
    let invalid = |e: mlua::Error| ScriptError::InvalidOutput(e.to_string());

    let table = match value {
        LuaValue::Nil => return Ok(ScriptOutput::Emit(Vec::new())),
        LuaValue::Table(table) => table,
        other => {
            return Err(ScriptError::InvalidOutput(format!(
                "expected nil or a table, got {}",
                other.type_name()
            )))
        }
    };

    if let Some(kind) = table.raw_get::<Option<String>>(DIRECTIVE_KEY).map_err(invalid)? {
        let reason: String = table.raw_get("reason").map_err(invalid)?;
        return match kind.as_str() {
            "retry" => Ok(ScriptOutput::Retry(reason)),
            "reject" => Ok(ScriptOutput::Reject(reason)),
            other => Err(ScriptError::InvalidOutput(format!("unknown directive '{other}'"))),
        };
    }

    let len = table.raw_len();
    if len == 0 {
        return Ok(ScriptOutput::Emit(vec![lua_to_json(LuaValue::Table(table), 0)
            .map_err(invalid)?]));
    }

    let mut payloads = Vec::with_capacity(len);
    for i in 1..=len {
        match table.raw_get::<LuaValue>(i).map_err(invalid)? {
            item @ LuaValue::Table(_) => payloads.push(lua_to_json(item, 0).map_err(invalid)?),
            other => {
                return Err(ScriptError::InvalidOutput(format!(
                    "element {i} is a {}, expected a table",
                    other.type_name()
                )))
            }
        }
    }
    Ok(ScriptOutput::Emit(payloads))
}

fn json_to_lua(lua: &Lua, value: &Value) -> mlua::Result<LuaValue> {
    Ok(match value {
        Value::Null => LuaValue::Nil,
        Value::Bool(b) => LuaValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => LuaValue::Integer(i),
            None => LuaValue::Number(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => LuaValue::String(lua.create_string(s)?),
        Value::Array(items) => {
            let table = lua.create_table()?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set(i + 1, json_to_lua(lua, item)?)?;
            }
            LuaValue::Table(table)
        }
        Value::Object(map) => {
            let table = lua.create_table()?;
            for (key, item) in map {
                table.raw_set(key.as_str(), json_to_lua(lua, item)?)?;
            }
            LuaValue::Table(table)
        }
    })
}

fn lua_to_json(value: LuaValue, depth: usize) -> mlua::Result<Value> {
    if depth > MAX_DEPTH {
        return Err(mlua::Error::RuntimeError("table nesting too deep".into()));
    }
    match value {
        LuaValue::Nil => Ok(Value::Null),
        LuaValue::Boolean(b) => Ok(Value::Bool(b)),
        LuaValue::Integer(i) => Ok(Value::Number(i.into())),
        LuaValue::Number(n) => serde_json::Number::from_f64(n)
            .map(Value::Number)
            .ok_or_else(|| mlua::Error::RuntimeError(format!("{n} is not a JSON number"))),
        LuaValue::String(s) => Ok(Value::String(s.to_str()?.to_string())),
        LuaValue::Table(table) => {
            let len = table.raw_len();
            if len > 0 {
                let mut items = Vec::with_capacity(len);
                for i in 1..=len {
                    items.push(lua_to_json(table.raw_get(i)?, depth + 1)?);
                }
                Ok(Value::Array(items))
            } else {
                let mut map = Map::new();
                for pair in table.pairs::<String, LuaValue>() {
                    let (key, item) = pair?;
                    map.insert(key, lua_to_json(item, depth + 1)?);
                }
                Ok(Value::Object(map))
            }
        }
        other => Err(mlua::Error::RuntimeError(format!(
            "{} cannot be converted to JSON",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    const TEST_MEMORY: usize = 16 * 1024 * 1024;

    fn run(source: &str, payload: Value) -> Result<ScriptOutput, ScriptError> {
        run_with(source, payload, Duration::from_secs(5), 10_000_000)
    }

    fn run_with(
        source: &str,
        payload: Value,
        timeout: Duration,
        max_instructions: u64,
    ) -> Result<ScriptOutput, ScriptError> {
        let limits = ScriptLimits {
            deadline: Instant::now() + timeout,
            max_instructions,
            max_memory: TEST_MEMORY,
        };
        run_limited(source, payload, &limits)
    }

    fn run_limited(
        source: &str,
        payload: Value,
        limits: &ScriptLimits,
    ) -> Result<ScriptOutput, ScriptError> {
        let input = ScriptInput {
            payload,
            event: json!({"id": "e-1", "subject": "crm.contact.created"}),
        };
        LuaRuntime::new().execute(&Script::new("test.lua", source), &input, limits)
    }

    #[test]
    fn returns_one_payload_from_a_table() {
        let output = run("return { score = payload.value * 2, subject = event.subject }", json!({"value": 42}));
        assert_eq!(
            output,
            Ok(ScriptOutput::Emit(vec![
                json!({"score": 84, "subject": "crm.contact.created"})
            ]))
        );
    }

    #[test]
    fn returns_many_payloads_from_an_array() {
        let output = run(
            "local out = {}\n\
             for i, tag in ipairs(payload.tags) do out[i] = { tag = tag } end\n\
             return out",
            json!({"tags": ["vip", "eu"]}),
        );
        assert_eq!(
            output,
            Ok(ScriptOutput::Emit(vec![json!({"tag": "vip"}), json!({"tag": "eu"})]))
        );
    }

    #[test]
    fn nil_emits_nothing() {
        assert_eq!(run("return nil", json!({})), Ok(ScriptOutput::Emit(vec![])));
        assert_eq!(run("local x = 1", json!({})), Ok(ScriptOutput::Emit(vec![])));
    }

    #[test]
    fn directives_classify_failures() {
        assert_eq!(
            run("return treehouse.retry('crm busy')", json!({})),
            Ok(ScriptOutput::Retry("crm busy".into()))
        );
        assert_eq!(
            run("if not payload.email then return treehouse.reject('missing email') end", json!({})),
            Ok(ScriptOutput::Reject("missing email".into()))
        );
    }

    #[test]
    fn sandbox_hides_ambient_capabilities() {
        for source in [
            "return os.time()",
            "return io.open('/etc/passwd')",
            "return require('socket')",
            "return load('return 1')()",
            "return dofile('/etc/passwd')",
            "return { n = math.random() }",
            "return pcall(error, 'x')",
        ] {
            assert!(
                matches!(run(source, json!({})), Err(ScriptError::Runtime(_))),
                "{source} should fail"
            );
        }
        assert_eq!(
            run("return { n = math.floor(2.5) }", json!({})),
            Ok(ScriptOutput::Emit(vec![json!({"n": 2})]))
        );
    }

    #[test]
    fn rejects_unsupported_return_values() {
        assert!(matches!(run("return 5", json!({})), Err(ScriptError::InvalidOutput(_))));
        assert!(matches!(run("return { 1, 2 }", json!({})), Err(ScriptError::InvalidOutput(_))));
    }

    #[test]
    fn infinite_loop_hits_the_deadline() {
        let started = Instant::now();
        let output = run_with("while true do end", json!({}), Duration::from_millis(50), u64::MAX);
        assert_eq!(output, Err(ScriptError::Timeout));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn instruction_budget_is_enforced() {
        let output = run_with("while true do end", json!({}), Duration::from_secs(30), 100_000);
        assert_eq!(output, Err(ScriptError::BudgetExhausted));
    }

    #[test]
    fn huge_allocation_hits_the_memory_limit() {
        let started = Instant::now();
        let output = run_with(
            "local s = string.rep('x', 400000000)\nreturn { n = #s }",
            json!({}),
            Duration::from_secs(5),
            u64::MAX,
        );
        assert_eq!(output, Err(ScriptError::MemoryExhausted(TEST_MEMORY)));
        assert!(started.elapsed() < Duration::from_secs(2));

        let growing = run_with(
            "local t = {}\nwhile true do t[#t + 1] = string.rep('y', 1024) end",
            json!({}),
            Duration::from_secs(5),
            u64::MAX,
        );
        assert_eq!(growing, Err(ScriptError::MemoryExhausted(TEST_MEMORY)));
    }

    #[test]
    fn result_finished_after_the_deadline_is_discarded() {
        // Too short for the hook to fire; the deadline has passed by the time it returns
        let limits = ScriptLimits {
            deadline: Instant::now(),
            max_instructions: u64::MAX,
            max_memory: TEST_MEMORY,
        };
        let output = run_limited("return { ok = true }", json!({}), &limits);
        assert_eq!(output, Err(ScriptError::Timeout));
    }

    #[test]
    fn same_input_same_output() {
        let source = "return { score = payload.value * 2 + #tostring(payload.value), tier = 'a' }";
        let first = run(source, json!({"value": 42}));
        let second = run(source, json!({"value": 42}));
        assert_eq!(first, second);
    }

    #[test]
    fn check_reports_syntax_errors() {
        let runtime = LuaRuntime::new();
        assert!(runtime.check(&Script::new("ok.lua", "return {}")).is_ok());
        assert!(matches!(
            runtime.check(&Script::new("bad.lua", "return {")),
            Err(ScriptError::Compile(_))
        ));
    }
}
