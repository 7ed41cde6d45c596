//! Where `(name, version)` pairs are bound to actual callables. Replaces the Python source's
//! `@hither.function` decorator, which had no equivalent at Rust's compile time -- registration
//! here is an explicit runtime call instead of an attribute on the function definition.

use crate::{ContainerImage, HitherError, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

/// A registered function body: takes already-resolved keyword arguments, returns a result value
/// or an error. Boxed and `Send + Sync` so a single registry entry can be called concurrently by
/// several worker threads (e.g. from `hither-parallel`'s in-process fallback path).
pub type RegisteredFn = Arc<dyn Fn(&crate::Value) -> anyhow::Result<crate::Value> + Send + Sync>;

#[derive(Clone)]
pub struct FunctionEntry {
    pub name: String,
    pub version: String,
    pub container: Option<ContainerImage>,
    pub f: RegisteredFn,
}

impl fmt::Debug for FunctionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionEntry")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("container", &self.container)
            .finish_non_exhaustive()
    }
}

/// A table of callable functions, keyed by `(name, version)`. One registry is normally enough
/// per process; [`default_registry`] provides a lazily-initialized process-wide instance for
/// callers who don't want to thread one through explicitly, alongside the option of
/// constructing and injecting a private one (e.g. in tests that register conflicting versions
/// of the same function name).
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    entries: Arc<Mutex<HashMap<(String, String), FunctionEntry>>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `f` under `(name, version)`. Re-registering the same `(name, version)` with a
    /// different container is rejected, mirroring the Python source's assumption that a given
    /// function version denotes one fixed implementation; re-registering with an identical
    /// container is a harmless no-op (useful for idempotent module-import-time registration).
    pub fn register(
        &self,
        name: impl Into<String>,
        version: impl Into<String>,
        container: Option<ContainerImage>,
        f: RegisteredFn,
    ) -> Result<()> {
        let name = name.into();
        let version = version.into();
        let mut entries = self.entries.lock().expect("registry mutex poisoned");
        let key = (name.clone(), version.clone());
        if let Some(existing) = entries.get(&key) {
            let same_container = existing.container.as_ref().map(ContainerImage::as_str)
                == container.as_ref().map(ContainerImage::as_str);
            if !same_container {
                return Err(HitherError::DuplicateFunction { name });
            }
            return Ok(());
        }
        entries.insert(
            key,
            FunctionEntry {
                name,
                version,
                container,
                f,
            },
        );
        Ok(())
    }

    pub fn lookup(&self, name: &str, version: &str) -> Option<FunctionEntry> {
        self.entries
            .lock()
            .expect("registry mutex poisoned")
            .get(&(name.to_string(), version.to_string()))
            .cloned()
    }
}

static DEFAULT_REGISTRY: OnceLock<FunctionRegistry> = OnceLock::new();

/// The process-wide default registry, analogous to the module-level registration dict the
/// Python source builds up as `@hither.function`-decorated modules are imported. Prefer an
/// explicit [`FunctionRegistry`] passed through your own call sites; this exists for the
/// common case of a single-binary CLI with no need to isolate registries.
pub fn default_registry() -> &'static FunctionRegistry {
    DEFAULT_REGISTRY.get_or_init(FunctionRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;

    fn noop(_: &Value) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }

    #[test]
    fn duplicate_registration_with_different_container_is_rejected() {
        let registry = FunctionRegistry::new();
        registry
            .register("f", "1.0.0", None, Arc::new(noop))
            .unwrap();
        let err = registry
            .register(
                "f",
                "1.0.0",
                Some(ContainerImage::parse("docker://img").unwrap()),
                Arc::new(noop),
            )
            .unwrap_err();
        assert!(matches!(err, HitherError::DuplicateFunction { .. }));
    }

    #[test]
    fn reregistering_identical_container_is_a_no_op() {
        let registry = FunctionRegistry::new();
        registry
            .register("f", "1.0.0", None, Arc::new(noop))
            .unwrap();
        registry
            .register("f", "1.0.0", None, Arc::new(noop))
            .unwrap();
        assert!(registry.lookup("f", "1.0.0").is_some());
    }

    #[test]
    fn lookup_distinguishes_versions() {
        let registry = FunctionRegistry::new();
        registry
            .register("f", "1.0.0", None, Arc::new(noop))
            .unwrap();
        assert!(registry.lookup("f", "1.0.0").is_some());
        assert!(registry.lookup("f", "2.0.0").is_none());
    }
}
