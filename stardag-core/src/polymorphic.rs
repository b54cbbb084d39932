//! The polymorphic type registry (§4.1 "Polymorphic registry").
//!
//! Rust has no class-definition-time side effects to piggyback on the way
//! the original's `__init_subclass__` hook does, so registration is
//! explicit: each task type calls [`TypeRegistry::register`] once, typically
//! from a `ctor`-free `lazy_static`-style `OnceLock` in its own module (see
//! `testing::demo_tasks` for the pattern every task type should follow).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value as Json;

use crate::identity::TypeId;
use crate::task::Task;

#[derive(thiserror::Error, Debug)]
pub enum PolymorphicError {
    #[error("no class registered for type id: {0}")]
    UnknownType(TypeId),
    #[error("type id {0} is already registered to a different constructor")]
    DuplicateRegistration(TypeId),
    #[error("payload missing discriminator keys `{0}`/`{1}`")]
    MissingDiscriminator(&'static str, &'static str),
    #[error("failed to deserialize payload for {0}: {1}")]
    Deserialize(TypeId, String),
}

type Constructor = Arc<dyn Fn(&Json) -> Result<Arc<dyn Task>, String> + Send + Sync>;

/// A constructor plus a discriminator identifying the closure type it was
/// registered with, so a second `register()` call under the same `type_id`
/// can tell "same call site re-running" (same closure type, tolerated) from
/// "a genuinely different class claiming this id" (rejected).
struct Entry {
    discriminator: std::any::TypeId,
    constructor: Constructor,
}

/// Registry mapping `(namespace, name) -> constructor`, one per polymorphic
/// root family. Stardag has a single root (`Task`), so one process-wide
/// registry suffices; keeping it as a type rather than a bare global makes
/// the "one registry per root type" rule in §4.1 explicit and lets tests
/// build isolated registries.
#[derive(Default)]
pub struct TypeRegistry {
    inner: RwLock<HashMap<TypeId, Entry>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for `type_id`. Re-registering the same
    /// `type_id` is a fatal error at registration time (§4.1 failure modes)
    /// unless it is the exact same constructor (idempotent re-import).
    pub fn register<F>(&self, type_id: TypeId, constructor: F) -> Result<(), PolymorphicError>
    where
        F: Fn(&Json) -> Result<Arc<dyn Task>, String> + Send + Sync + 'static,
    {
        let discriminator = std::any::TypeId::of::<F>();
        let mut map = self.inner.write().expect("registry lock poisoned");
        if let Some(existing) = map.get(&type_id) {
            if existing.discriminator != discriminator {
                return Err(PolymorphicError::DuplicateRegistration(type_id));
            }
            // Same call site re-running (e.g. a test re-initializing a
            // `OnceLock`): tolerated, matches the original's "already
            // registered, same class" leniency.
            return Ok(());
        }
        map.insert(
            type_id,
            Entry {
                discriminator,
                constructor: Arc::new(constructor),
            },
        );
        Ok(())
    }

    pub fn is_registered(&self, type_id: &TypeId) -> bool {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .contains_key(type_id)
    }

    /// Construct a task from its transport-mode JSON payload.
    pub fn deserialize(&self, payload: &Json) -> Result<Arc<dyn Task>, PolymorphicError> {
        let obj = payload
            .as_object()
            .ok_or_else(|| PolymorphicError::MissingDiscriminator(
                crate::identity::TYPE_NAMESPACE_KEY,
                crate::identity::TYPE_NAME_KEY,
            ))?;
        let namespace = obj
            .get(crate::identity::TYPE_NAMESPACE_KEY)
            .and_then(Json::as_str)
            .ok_or_else(|| PolymorphicError::MissingDiscriminator(
                crate::identity::TYPE_NAMESPACE_KEY,
                crate::identity::TYPE_NAME_KEY,
            ))?;
        let name = obj
            .get(crate::identity::TYPE_NAME_KEY)
            .and_then(Json::as_str)
            .ok_or_else(|| PolymorphicError::MissingDiscriminator(
                crate::identity::TYPE_NAMESPACE_KEY,
                crate::identity::TYPE_NAME_KEY,
            ))?;
        let type_id = TypeId::new(namespace, name);

        let constructor = {
            let map = self.inner.read().expect("registry lock poisoned");
            map.get(&type_id)
                .map(|entry| entry.constructor.clone())
                .ok_or_else(|| PolymorphicError::UnknownType(type_id.clone()))?
        };

        constructor(payload).map_err(|e| PolymorphicError::Deserialize(type_id, e))
    }
}

/// The process-wide registry for the `Task` polymorphic family.
static GLOBAL_REGISTRY: std::sync::OnceLock<TypeRegistry> = std::sync::OnceLock::new();

pub fn global_registry() -> &'static TypeRegistry {
    GLOBAL_REGISTRY.get_or_init(TypeRegistry::new)
}

/// The process-wide fallback namespace for [`TypeId`]s that don't spell
/// their own out (§4.1 "Polymorphic registry": "the namespace defaults to
/// the module path of the defining file unless explicitly overridden").
/// Rust has no class-definition-time hook to derive this automatically, so
/// a crate calls [`set_default_namespace`] once — typically from its own
/// top-level module — instead of annotating every task type with its full
/// namespace string.
static DEFAULT_NAMESPACE: std::sync::OnceLock<std::sync::Mutex<Option<String>>> =
    std::sync::OnceLock::new();

fn default_namespace_cell() -> &'static std::sync::Mutex<Option<String>> {
    DEFAULT_NAMESPACE.get_or_init(|| std::sync::Mutex::new(None))
}

/// Bind the process-wide default namespace used by [`type_id_in_default_namespace`].
/// Last writer wins; call once at process start, before any task type
/// resolves its `type_id()`.
pub fn set_default_namespace(namespace: impl Into<String>) {
    *default_namespace_cell().lock().expect("poisoned") = Some(namespace.into());
}

pub fn default_namespace() -> Option<String> {
    default_namespace_cell().lock().expect("poisoned").clone()
}

/// Build a `TypeId` for `name` in the process-wide default namespace,
/// falling back to `"stardag"` if none has been set. A convenience for task
/// types that don't need a bespoke namespace per §4.1's
/// `auto_namespace`/`namespace` module-scope declaration.
pub fn type_id_in_default_namespace(name: impl Into<String>) -> TypeId {
    TypeId::new(default_namespace().unwrap_or_else(|| "stardag".to_string()), name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_id_is_a_typed_error() {
        let reg = TypeRegistry::new();
        let payload = serde_json::json!({
            "__namespace": "nope",
            "__name": "nope",
        });
        let err = reg.deserialize(&payload).unwrap_err();
        assert!(matches!(err, PolymorphicError::UnknownType(_)));
    }

    #[test]
    fn missing_discriminator_is_a_typed_error() {
        let reg = TypeRegistry::new();
        let payload = serde_json::json!({"a": 1});
        let err = reg.deserialize(&payload).unwrap_err();
        assert!(matches!(err, PolymorphicError::MissingDiscriminator(_, _)));
    }

    #[test]
    fn reregistering_same_call_site_is_idempotent() {
        let reg = TypeRegistry::new();
        let type_id = TypeId::new("stardag.tests", "Widget");
        let make = |_: &Json| -> Result<Arc<dyn Task>, String> { Err("unused".to_string()) };
        reg.register(type_id.clone(), make).unwrap();
        reg.register(type_id, make).unwrap();
    }

    #[test]
    fn default_namespace_falls_back_when_unset() {
        // This test shares process-wide state with any other test that
        // calls `set_default_namespace`; only assert the unset fallback
        // when nothing has bound it yet in this test binary's run.
        if default_namespace().is_none() {
            assert_eq!(
                type_id_in_default_namespace("Widget"),
                TypeId::new("stardag", "Widget")
            );
        }
    }

    #[test]
    fn set_default_namespace_is_used_by_the_convenience_constructor() {
        set_default_namespace("myapp.tasks");
        assert_eq!(
            type_id_in_default_namespace("Widget"),
            TypeId::new("myapp.tasks", "Widget")
        );
    }

    #[test]
    fn reregistering_with_a_different_constructor_is_fatal() {
        let reg = TypeRegistry::new();
        let type_id = TypeId::new("stardag.tests", "Widget");
        reg.register(type_id.clone(), |_: &Json| -> Result<Arc<dyn Task>, String> {
            Err("a".to_string())
        })
        .unwrap();
        let err = reg
            .register(type_id, |_: &Json| -> Result<Arc<dyn Task>, String> {
                Err("b".to_string())
            })
            .unwrap_err();
        assert!(matches!(err, PolymorphicError::DuplicateRegistration(_)));
    }
}
