//! Materializers: explicit `type_tag -> (serialize, deserialize)` pairs.
//!
//! The tag is stored in the catalog next to every version, so pulling never guesses how to
//! decode a payload. Registration is validated up front; a second registration under the
//! same tag must be the identical pair.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::MaterializerError;

/// In-memory form of a stored object.
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    Json(Value),
    Yaml(Value),
    Text(String),
    Bytes(Bytes),
    /// Row-oriented dataset, one JSON record per row.
    Records(Vec<Value>),
}

impl Artifact {
    pub fn kind(&self) -> &'static str {
        match self {
            Artifact::Json(_) => "json",
            Artifact::Yaml(_) => "yaml",
            Artifact::Text(_) => "text",
            Artifact::Bytes(_) => "bytes",
            Artifact::Records(_) => "records",
        }
    }
}

impl From<Value> for Artifact {
    fn from(v: Value) -> Self { Artifact::Json(v) }
}

pub type SerializeFn = fn(&Artifact) -> Result<Bytes, MaterializerError>;
pub type DeserializeFn = fn(&[u8]) -> Result<Artifact, MaterializerError>;

#[derive(Debug, Clone, Copy)]
pub struct Materializer {
    pub serialize: SerializeFn,
    pub deserialize: DeserializeFn,
    pub content_type: &'static str,
}

impl Materializer {
    pub const fn new(serialize: SerializeFn, deserialize: DeserializeFn, content_type: &'static str) -> Self {
        Self { serialize, deserialize, content_type }
    }

    fn same_as(&self, other: &Materializer) -> bool {
        std::ptr::fn_addr_eq(self.serialize, other.serialize)
            && std::ptr::fn_addr_eq(self.deserialize, other.deserialize)
            && self.content_type == other.content_type
    }
}

pub const JSON: &str = "json";
pub const YAML: &str = "yaml";
pub const TEXT: &str = "text";
pub const BYTES: &str = "bytes";
pub const JSONL: &str = "jsonl";

#[derive(Debug, Default)]
pub struct MaterializerRegistry {
    entries: RwLock<HashMap<String, Materializer>>,
}

impl MaterializerRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn with_builtins() -> Self {
        let reg = Self::new();
        for (tag, m) in builtins() {
            // fresh registry: cannot collide
            let _ = reg.register(tag, m);
        }
        reg
    }

    pub fn register(&self, type_tag: &str, materializer: Materializer) -> Result<(), MaterializerError> {
        let mut entries = self.entries.write();
        match entries.get(type_tag) {
            Some(existing) if existing.same_as(&materializer) => Ok(()),
            Some(_) => Err(MaterializerError::Duplicate(type_tag.to_string())),
            None => {
                entries.insert(type_tag.to_string(), materializer);
                tracing::debug!(type_tag, "materializer registered");
                Ok(())
            }
        }
    }

    pub fn resolve(&self, type_tag: &str) -> Result<Materializer, MaterializerError> {
        self.entries.read().get(type_tag).copied().ok_or_else(|| MaterializerError::Unknown(type_tag.to_string()))
    }

    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.entries.read().keys().cloned().collect();
        tags.sort();
        tags
    }

    pub fn serialize(&self, type_tag: &str, artifact: &Artifact) -> Result<Bytes, MaterializerError> {
        (self.resolve(type_tag)?.serialize)(artifact)
    }

    pub fn deserialize(&self, type_tag: &str, bytes: &[u8]) -> Result<Artifact, MaterializerError> {
        (self.resolve(type_tag)?.deserialize)(bytes)
    }
}

pub fn builtins() -> Vec<(&'static str, Materializer)> {
    vec![
        (JSON, Materializer::new(json_ser, json_de, "application/json")),
        (YAML, Materializer::new(yaml_ser, yaml_de, "application/yaml")),
        (TEXT, Materializer::new(text_ser, text_de, "text/plain; charset=utf-8")),
        (BYTES, Materializer::new(bytes_ser, bytes_de, "application/octet-stream")),
        (JSONL, Materializer::new(jsonl_ser, jsonl_de, "application/x-ndjson")),
    ]
}

fn mismatch(tag: &str, expected: &'static str, found: &Artifact) -> MaterializerError {
    MaterializerError::VariantMismatch { tag: tag.to_string(), expected, found: found.kind() }
}

fn encode_err(tag: &str, e: impl ToString) -> MaterializerError { MaterializerError::Encode { tag: tag.to_string(), message: e.to_string() } }
fn decode_err(tag: &str, e: impl ToString) -> MaterializerError { MaterializerError::Decode { tag: tag.to_string(), message: e.to_string() } }

fn json_ser(a: &Artifact) -> Result<Bytes, MaterializerError> {
    match a {
        Artifact::Json(v) => serde_json::to_vec(v).map(Bytes::from).map_err(|e| encode_err(JSON, e)),
        other => Err(mismatch(JSON, "json", other)),
    }
}

fn json_de(b: &[u8]) -> Result<Artifact, MaterializerError> {
    serde_json::from_slice(b).map(Artifact::Json).map_err(|e| decode_err(JSON, e))
}

fn yaml_ser(a: &Artifact) -> Result<Bytes, MaterializerError> {
    match a {
        Artifact::Yaml(v) => serde_yaml::to_string(v).map(Bytes::from).map_err(|e| encode_err(YAML, e)),
        other => Err(mismatch(YAML, "yaml", other)),
    }
}

fn yaml_de(b: &[u8]) -> Result<Artifact, MaterializerError> {
    serde_yaml::from_slice(b).map(Artifact::Yaml).map_err(|e| decode_err(YAML, e))
}

fn text_ser(a: &Artifact) -> Result<Bytes, MaterializerError> {
    match a {
        Artifact::Text(s) => Ok(Bytes::from(s.clone())),
        other => Err(mismatch(TEXT, "text", other)),
    }
}

fn text_de(b: &[u8]) -> Result<Artifact, MaterializerError> {
    String::from_utf8(b.to_vec()).map(Artifact::Text).map_err(|e| decode_err(TEXT, e))
}

fn bytes_ser(a: &Artifact) -> Result<Bytes, MaterializerError> {
    match a {
        Artifact::Bytes(b) => Ok(b.clone()),
        other => Err(mismatch(BYTES, "bytes", other)),
    }
}

fn bytes_de(b: &[u8]) -> Result<Artifact, MaterializerError> { Ok(Artifact::Bytes(Bytes::copy_from_slice(b))) }

fn jsonl_ser(a: &Artifact) -> Result<Bytes, MaterializerError> {
    let Artifact::Records(rows) = a else { return Err(mismatch(JSONL, "records", a)) };
    let mut out = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut out, row).map_err(|e| encode_err(JSONL, e))?;
        out.push(b'\n');
    }
    Ok(Bytes::from(out))
}

fn jsonl_de(b: &[u8]) -> Result<Artifact, MaterializerError> {
    let text = std::str::from_utf8(b).map_err(|e| decode_err(JSONL, e))?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .enumerate()
        .map(|(i, l)| serde_json::from_str(l).map_err(|e| decode_err(JSONL, format!("line {}: {e}", i + 1))))
        .collect::<Result<Vec<Value>, _>>()
        .map(Artifact::Records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(tag: &str, a: Artifact) {
        let reg = MaterializerRegistry::with_builtins();
        let bytes = reg.serialize(tag, &a).unwrap();
        assert_eq!(reg.deserialize(tag, &bytes).unwrap(), a, "tag {tag}");
    }

    #[test]
    fn builtins_roundtrip() {
        roundtrip(JSON, Artifact::Json(json!({"w": [1, 2, 3], "nested": {"deep": [true, null]}})));
        roundtrip(YAML, Artifact::Yaml(json!({"lr": 0.01, "layers": ["a", "b"]})));
        roundtrip(TEXT, Artifact::Text("héllo\nworld".into()));
        roundtrip(BYTES, Artifact::Bytes(Bytes::from_static(&[0, 159, 146, 150])));
        roundtrip(JSONL, Artifact::Records(vec![json!({"x": 1}), json!({"x": 2, "y": "z"})]));
    }

    #[test]
    fn wrong_variant_fails_loudly() {
        let reg = MaterializerRegistry::with_builtins();
        let err = reg.serialize(JSON, &Artifact::Text("x".into())).unwrap_err();
        assert_eq!(err, MaterializerError::VariantMismatch { tag: JSON.into(), expected: "json", found: "text" });
        assert!(matches!(reg.deserialize(JSON, b"\xff\xfe"), Err(MaterializerError::Decode { .. })));
    }

    #[test]
    fn unknown_tag() {
        let reg = MaterializerRegistry::with_builtins();
        assert_eq!(reg.resolve("onnx").unwrap_err(), MaterializerError::Unknown("onnx".into()));
    }

    #[test]
    fn reregistration_must_be_identical() {
        let reg = MaterializerRegistry::with_builtins();
        reg.register(JSON, Materializer::new(json_ser, json_de, "application/json")).unwrap();
        let err = reg.register(JSON, Materializer::new(text_ser, text_de, "text/plain")).unwrap_err();
        assert_eq!(err, MaterializerError::Duplicate(JSON.into()));
        assert_eq!(reg.tags(), vec!["bytes", "json", "jsonl", "text", "yaml"]);
    }
}
