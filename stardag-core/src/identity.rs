//! Canonical (hash-mode) and transport-mode serialization, and the UUID5
//! derivation of a task's id (§4.1).

use std::sync::OnceLock;

use serde_json::Value as Json;
use uuid::Uuid;

use crate::param::{field_included_in_hash, Mode};
use crate::task::Task;

/// `(namespace, name)`: the logical class identifier of a task, resolvable
/// to a constructor via [`crate::polymorphic::TypeRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId {
    pub namespace: String,
    pub name: String,
}

impl TypeId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for TypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

pub const TYPE_NAMESPACE_KEY: &str = "__namespace";
pub const TYPE_NAME_KEY: &str = "__name";

/// Never change this value: it is used to generate stable UUID5 ids for
/// tasks. A process may override it via [`set_task_uuid5_namespace`], but
/// the default MUST stay stable across releases or every cache goes cold.
const DEFAULT_TASK_UUID5_NAMESPACE: Uuid = Uuid::from_bytes([
    0x9c, 0xa2, 0x6b, 0x27, 0xf7, 0xee, 0x40, 0x44, 0x8b, 0x3c, 0xe3, 0x35, 0xdc, 0x57, 0x78, 0xdc,
]);

static TASK_UUID5_NAMESPACE: OnceLock<Uuid> = OnceLock::new();

/// Configure the process-wide namespace used for task id derivation.
///
/// Must be called before any task id is computed; subsequent calls are a
/// no-op (the first writer wins, matching the once-at-startup intent of
/// spec §4.1 rule 7). Changing this value breaks all existing caches.
pub fn set_task_uuid5_namespace(namespace: Uuid) {
    let _ = TASK_UUID5_NAMESPACE.set(namespace);
}

fn task_uuid5_namespace() -> Uuid {
    *TASK_UUID5_NAMESPACE.get_or_init(|| DEFAULT_TASK_UUID5_NAMESPACE)
}

/// Canonical JSON dump: fixed `(",", ":")` separators, deep `sort_keys`, and
/// `ensure_ascii`-style escaping of every non-ASCII codepoint to `\uXXXX`,
/// matching `original_source`'s `_hash_safe_json_dumps` (Python's
/// `json.dumps` defaults `ensure_ascii=True`). `serde_json::to_vec` emits
/// raw UTF-8 for string values, which would hash non-ASCII params to a
/// different id than the original — so this walks the value tree by hand
/// instead of delegating to serde_json's writer.
fn canonical_json_bytes(value: &Json) -> Vec<u8> {
    fn write_string(out: &mut String, s: &str) {
        out.push('"');
        for ch in s.chars() {
            match ch {
                '"' => out.push_str("\\\""),
                '\\' => out.push_str("\\\\"),
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
                c if (c as u32) < 0x7f => out.push(c),
                c => {
                    let cp = c as u32;
                    if cp <= 0xffff {
                        out.push_str(&format!("\\u{:04x}", cp));
                    } else {
                        // Surrogate pair, matching `ensure_ascii`'s handling
                        // of codepoints outside the BMP.
                        let cp = cp - 0x10000;
                        let high = 0xd800 + (cp >> 10);
                        let low = 0xdc00 + (cp & 0x3ff);
                        out.push_str(&format!("\\u{:04x}\\u{:04x}", high, low));
                    }
                }
            }
        }
        out.push('"');
    }

    fn write_value(out: &mut String, v: &Json) {
        match v {
            Json::Null => out.push_str("null"),
            Json::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Json::Number(n) => out.push_str(&n.to_string()),
            Json::String(s) => write_string(out, s),
            Json::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write_value(out, item);
                }
                out.push(']');
            }
            Json::Object(map) => {
                out.push('{');
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                for (i, (k, v)) in entries.into_iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write_string(out, k);
                    out.push(':');
                    write_value(out, v);
                }
                out.push('}');
            }
        }
    }

    let mut out = String::new();
    write_value(&mut out, value);
    out.into_bytes()
}

/// Build the hash-mode JSON object for a task: `{__namespace, __name,
/// version, <non-excluded fields>}` (§4.1 rules 1–3, 5–6).
pub fn hash_mode_jsonable(task: &dyn Task) -> Json {
    let mut obj = serde_json::Map::new();
    let type_id = task.type_id();
    obj.insert(
        TYPE_NAMESPACE_KEY.to_string(),
        Json::String(type_id.namespace.clone()),
    );
    obj.insert(TYPE_NAME_KEY.to_string(), Json::String(type_id.name.clone()));
    obj.insert("version".to_string(), Json::String(task.version().to_string()));

    for param in task.params() {
        if !field_included_in_hash(&param) {
            continue;
        }
        obj.insert(param.name.to_string(), param.value.to_json(Mode::Hash));
    }

    Json::Object(obj)
}

/// Derive a task's id from its hash-mode canonical serialization.
///
/// `id = UUID5(namespace = <process-wide constant>, name = canonical-json-bytes)`
pub fn compute_task_id(task: &dyn Task) -> Uuid {
    let jsonable = hash_mode_jsonable(task);
    let bytes = canonical_json_bytes(&jsonable);
    Uuid::new_v5(&task_uuid5_namespace(), &bytes)
}

/// Transport-mode dump: every field, discriminator keys at every
/// polymorphic node, round-trips back to an identical task.
pub fn dump_transport(task: &dyn Task) -> Json {
    let mut obj = serde_json::Map::new();
    let type_id = task.type_id();
    obj.insert(
        TYPE_NAMESPACE_KEY.to_string(),
        Json::String(type_id.namespace.clone()),
    );
    obj.insert(TYPE_NAME_KEY.to_string(), Json::String(type_id.name.clone()));
    obj.insert("version".to_string(), Json::String(task.version().to_string()));

    for param in task.params() {
        obj.insert(param.name.to_string(), param.value.to_json(Mode::Transport));
    }

    Json::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::demo_tasks::Add;

    /// I-1/I-2 (spec §8): identical hash-mode serialization implies
    /// identical id, and transport round-trip preserves id.
    #[test]
    fn identical_params_yield_identical_id() {
        let a = Add::new(1, 2);
        let b = Add::new(1, 2);
        assert_eq!(a.id(), b.id());

        let c = Add::new(1, 3);
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn id_is_stable_regardless_of_map_key_order() {
        // Map ordering is asserted at the ParamValue::Map level (sorted
        // unconditionally in to_json), exercised indirectly via nested task
        // composition in build tests.
        let namespace_differs = TypeId::new("a", "x") == TypeId::new("b", "x");
        assert!(!namespace_differs);
    }

    #[test]
    fn non_ascii_string_values_are_escaped_ensure_ascii_style() {
        let bytes = canonical_json_bytes(&serde_json::json!({"b": "caf\u{e9}", "a": 1}));
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.is_ascii());
        assert_eq!(text, "{\"a\":1,\"b\":\"caf\\u00e9\"}");
    }

    #[test]
    fn non_bmp_codepoints_are_escaped_as_surrogate_pairs() {
        let bytes = canonical_json_bytes(&serde_json::json!({"emoji": "\u{1f600}"}));
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.is_ascii());
        assert_eq!(text, "{\"emoji\":\"\\ud83d\\ude00\"}");
    }
}
