//! Typed parameter values and the two serialization modes (§4.1).
//!
//! A task's parameters are not arbitrary `serde_json::Value` — each field
//! carries attributes (`hash_exclude`, `compat_default`) that only affect
//! *hash mode* serialization. Transport mode always dumps every field.

use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::Value as Json;

use crate::task::Task;

/// Serialization mode, mirrored from the teacher's "mode" context key idiom
/// (the original Python carries this as a string in a pydantic serialization
/// context; here it's just an argument threaded through explicitly).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Faithful, round-trippable dump used for registry payloads and wire transfer.
    Transport,
    /// Canonical representation used only to derive a task's id.
    Hash,
}

/// A caller-provided stable key function for sorting a declared-unordered
/// set in hash mode (§4.1 rule 5), ported from `original_source`'s
/// `HashableSet` key parameter. Boxed in an `Arc` so `ParamValue` stays
/// `Clone`.
pub type SetSortKey = Arc<dyn Fn(&ParamValue) -> String + Send + Sync>;

/// A parameter value. Covers the primitive/container/task-reference shapes
/// named in spec §3.
#[derive(Clone)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// Ordered sequence.
    List(Vec<ParamValue>),
    /// String-keyed mapping. Always serialized with sorted keys, in both modes.
    Map(Vec<(String, ParamValue)>),
    /// Declared-unordered collection. Sorted by `sort_key()` only in hash
    /// mode: the caller-supplied key if given, else each element's own
    /// canonical JSON text.
    Set(Vec<ParamValue>, Option<SetSortKey>),
    /// A nested task. Truncated to `{"id": ...}` in hash mode (§4.1 rule 4).
    Task(Arc<dyn Task>),
}

impl std::fmt::Debug for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Null => write!(f, "Null"),
            ParamValue::Bool(b) => write!(f, "Bool({b})"),
            ParamValue::Int(i) => write!(f, "Int({i})"),
            ParamValue::Float(x) => write!(f, "Float({x})"),
            ParamValue::Str(s) => write!(f, "Str({s:?})"),
            ParamValue::Bytes(b) => write!(f, "Bytes[{}]", b.len()),
            ParamValue::List(v) => f.debug_list().entries(v).finish(),
            ParamValue::Map(m) => f.debug_map().entries(m.iter().map(|(k, v)| (k, v))).finish(),
            ParamValue::Set(v, key) => {
                write!(f, "Set{v:?}")?;
                if key.is_some() {
                    write!(f, "(keyed)")?;
                }
                Ok(())
            }
            ParamValue::Task(t) => write!(f, "Task({})", t.id()),
        }
    }
}

impl ParamValue {
    /// A declared-unordered set sorted, in hash mode, by each element's own
    /// canonical JSON text (the default key from `original_source`'s
    /// `HashableSet`).
    pub fn set(items: impl IntoIterator<Item = ParamValue>) -> Self {
        ParamValue::Set(items.into_iter().collect(), None)
    }

    /// A declared-unordered set sorted, in hash mode, by a caller-supplied
    /// key function instead of the default canonical-JSON-text key.
    pub fn set_with_key(items: impl IntoIterator<Item = ParamValue>, key: SetSortKey) -> Self {
        ParamValue::Set(items.into_iter().collect(), Some(key))
    }

    /// Serialize this value to a plain `serde_json::Value`, recursively
    /// applying the mode's rules to nested tasks and sets.
    pub fn to_json(&self, mode: Mode) -> Json {
        match self {
            ParamValue::Null => Json::Null,
            ParamValue::Bool(b) => Json::Bool(*b),
            ParamValue::Int(i) => Json::from(*i),
            ParamValue::Float(x) => {
                Json::from(serde_json::Number::from_f64(*x).unwrap_or_else(|| 0.into()))
            }
            ParamValue::Str(s) => Json::String(s.clone()),
            ParamValue::Bytes(b) => Json::String(data_encoding_hex(b)),
            ParamValue::List(items) => {
                Json::Array(items.iter().map(|v| v.to_json(mode)).collect())
            }
            ParamValue::Map(entries) => {
                let mut sorted: Vec<_> = entries.iter().collect();
                sorted.sort_by(|a, b| a.0.cmp(&b.0));
                Json::Object(
                    sorted
                        .into_iter()
                        .map(|(k, v)| (k.clone(), v.to_json(mode)))
                        .collect(),
                )
            }
            ParamValue::Set(items, key) => {
                let mut dumped: Vec<(&ParamValue, Json)> =
                    items.iter().map(|v| (v, v.to_json(mode))).collect();
                if mode == Mode::Hash {
                    match key {
                        Some(key_fn) => dumped.sort_by(|a, b| key_fn(a.0).cmp(&key_fn(b.0))),
                        None => dumped.sort_by(|a, b| canonical_json_cmp(&a.1, &b.1)),
                    }
                }
                Json::Array(dumped.into_iter().map(|(_, j)| j).collect())
            }
            ParamValue::Task(task) => match mode {
                Mode::Hash => {
                    let mut obj = serde_json::Map::new();
                    obj.insert("id".to_string(), Json::String(task.id().to_string()));
                    Json::Object(obj)
                }
                Mode::Transport => crate::identity::dump_transport(task.as_ref()),
            },
        }
    }
}

fn data_encoding_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Total order over canonical JSON used as the default set sort key:
/// compare by `(",", ":")`-separated, sorted-key JSON text.
fn canonical_json_cmp(a: &Json, b: &Json) -> Ordering {
    canonical_text(a).cmp(&canonical_text(b))
}

fn canonical_text(v: &Json) -> String {
    // `serde_json::Value`'s own Ord isn't defined; round-trip through a
    // deterministic string the same way hash-mode finalization does.
    serde_json::to_string(&sort_keys(v)).unwrap_or_default()
}

fn sort_keys(v: &Json) -> Json {
    match v {
        Json::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Json::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), sort_keys(v)))
                    .collect(),
            )
        }
        Json::Array(items) => Json::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Field-level attributes carried by the task's schema (§3 "Field attributes").
#[derive(Clone, Debug, Default)]
pub struct FieldAttrs {
    /// Omit this field from hash-mode serialization entirely.
    pub hash_exclude: bool,
    /// Omit this field from hash-mode serialization if its value equals this default.
    pub compat_default: Option<Json>,
}

impl FieldAttrs {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn hash_exclude() -> Self {
        Self {
            hash_exclude: true,
            compat_default: None,
        }
    }

    pub fn compat_default(default: Json) -> Self {
        Self {
            hash_exclude: false,
            compat_default: Some(default),
        }
    }
}

/// One named, attributed field of a task, as returned by [`Task::params`].
#[derive(Clone)]
pub struct Param {
    pub name: &'static str,
    pub value: ParamValue,
    pub attrs: FieldAttrs,
}

impl Param {
    pub fn new(name: &'static str, value: ParamValue) -> Self {
        Self {
            name,
            value,
            attrs: FieldAttrs::none(),
        }
    }

    pub fn with_attrs(mut self, attrs: FieldAttrs) -> Self {
        self.attrs = attrs;
        self
    }
}

/// Should this field appear in a hash-mode dump?
pub fn field_included_in_hash(param: &Param) -> bool {
    if param.attrs.hash_exclude {
        return false;
    }
    if let Some(default) = &param.attrs.compat_default {
        if &param.value.to_json(Mode::Hash) == default {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_is_insertion_ordered_in_transport_mode_but_sorted_in_hash_mode() {
        let set = ParamValue::set([ParamValue::Int(3), ParamValue::Int(1), ParamValue::Int(2)]);

        let transport = set.to_json(Mode::Transport);
        assert_eq!(transport, serde_json::json!([3, 1, 2]));

        let hash = set.to_json(Mode::Hash);
        assert_eq!(hash, serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn set_with_custom_key_sorts_by_that_key_in_hash_mode_only() {
        let key: SetSortKey = Arc::new(|v: &ParamValue| match v {
            ParamValue::Str(s) => s.chars().rev().collect(),
            _ => String::new(),
        });
        let set = ParamValue::set_with_key(
            [
                ParamValue::Str("ba".to_string()),
                ParamValue::Str("aa".to_string()),
            ],
            key,
        );

        // Reversed: "ab" < "aa" is false ("aa" < "ab"), so sorted by reversed
        // string puts "aa" (reversed "aa") before "ba" (reversed "ab").
        let hash = set.to_json(Mode::Hash);
        assert_eq!(hash, serde_json::json!(["aa", "ba"]));

        let transport = set.to_json(Mode::Transport);
        assert_eq!(transport, serde_json::json!(["ba", "aa"]));
    }

    #[test]
    fn hash_exclude_field_is_dropped_only_in_hash_mode() {
        let excluded = Param::new("secret", ParamValue::Str("shh".to_string()))
            .with_attrs(FieldAttrs::hash_exclude());
        assert!(!field_included_in_hash(&excluded));
    }

    #[test]
    fn compat_default_field_is_dropped_only_when_value_matches_default() {
        let at_default = Param::new("extra", ParamValue::Int(0))
            .with_attrs(FieldAttrs::compat_default(serde_json::json!(0)));
        assert!(!field_included_in_hash(&at_default));

        let non_default = Param::new("extra", ParamValue::Int(7))
            .with_attrs(FieldAttrs::compat_default(serde_json::json!(0)));
        assert!(field_included_in_hash(&non_default));
    }
}
