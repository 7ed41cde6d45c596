//! A handful of built-in demo functions `hither-run` can call. There is no source-to-code
//! transformer in this workspace (see the crate docs), so a CLI has no way to load a function
//! body the caller wrote themselves -- these are the only functions a bare `hither-run`
//! invocation can ever name. Anything past a smoke test should embed `hither-manager` directly
//! and register its own functions instead.

use anyhow::{anyhow, Context, Result};
use hither_base::{FunctionRegistry, Value};
use hither_handler::QueuedJob;

pub const CATALOG: &[(&str, &str, &str)] = &[
    ("identity", "1", "returns its single argument unchanged"),
    ("add", "1", "{\"a\": int, \"b\": int} -> a + b"),
    ("concat", "1", "{\"items\": [str, ...]} -> the strings joined with no separator"),
    ("uppercase", "1", "a string -> its ASCII-uppercased form"),
];

fn call(name: &str, version: &str, kwargs: &Value) -> Result<Value> {
    match (name, version) {
        ("identity", "1") => Ok(kwargs.clone()),
        ("add", "1") => {
            let a = arg_int(kwargs, "a")?;
            let b = arg_int(kwargs, "b")?;
            Ok(Value::Int(a + b))
        }
        ("concat", "1") => {
            let Value::Map { entries } = kwargs else {
                anyhow::bail!("concat expects a map with an \"items\" entry");
            };
            let Some(Value::List { items }) = entries.get("items") else {
                anyhow::bail!("concat expects an \"items\" list");
            };
            let mut joined = String::new();
            for item in items {
                joined.push_str(
                    item.as_str()
                        .ok_or_else(|| anyhow!("concat's items must all be strings"))?,
                );
            }
            Ok(Value::Str(joined))
        }
        ("uppercase", "1") => {
            let s = kwargs
                .as_str()
                .ok_or_else(|| anyhow!("uppercase expects a string argument"))?;
            Ok(Value::Str(s.to_ascii_uppercase()))
        }
        (other, version) => Err(anyhow!("no such function: {other} v{version}")),
    }
}

fn arg_int(kwargs: &Value, key: &str) -> Result<i64> {
    let Value::Map { entries } = kwargs else {
        anyhow::bail!("expected a map argument with a {key:?} entry");
    };
    entries
        .get(key)
        .and_then(Value::as_int)
        .with_context(|| format!("missing or non-integer {key:?} entry"))
}

/// Registers every built-in function under `registry`, so a job submitted with
/// `FunctionCode::Local` resolves to something real even though nothing in this workspace
/// actually consults the registry to run a job -- see [`dispatcher`].
pub fn register_all(registry: &FunctionRegistry) -> Result<()> {
    for &(name, version, _) in CATALOG {
        registry.register(
            name,
            version,
            None,
            std::sync::Arc::new(move |kwargs: &Value| call(name, version, kwargs)),
        )?;
    }
    Ok(())
}

/// The closure handed to the manager's `default` handler: looks a queued job's function up in
/// [`CATALOG`] by name and version and runs it against the job's already-resolved `kwargs`.
pub fn dispatcher() -> impl FnMut(&QueuedJob) -> Result<Value> + Send {
    move |job: &QueuedJob| call(&job.function_name, &job.function_version, &job.kwargs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hither_base::ValueMap;

    #[test]
    fn add_sums_its_two_named_arguments() {
        let mut entries = ValueMap::new();
        entries.insert("a", Value::Int(2));
        entries.insert("b", Value::Int(40));
        assert_eq!(call("add", "1", &Value::Map { entries }).unwrap(), Value::Int(42));
    }

    #[test]
    fn uppercase_rejects_a_non_string_argument() {
        assert!(call("uppercase", "1", &Value::Int(1)).is_err());
    }

    #[test]
    fn an_unknown_function_name_is_an_error() {
        assert!(call("nonexistent", "1", &Value::Null).is_err());
    }

    #[test]
    fn register_all_registers_every_catalog_entry_without_conflict() {
        let registry = FunctionRegistry::new();
        register_all(&registry).unwrap();
        register_all(&registry).unwrap();
        assert!(registry.lookup("add", "1").is_some());
    }
}
