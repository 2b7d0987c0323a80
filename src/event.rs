//! Change event model.
//!
//! These types mirror the wire shape emitted by a document database change
//! stream, so they deserialize straight from the driver's JSON and can be
//! forwarded to subscribers unchanged.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of mutation a change event describes.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
    Drop,
    Rename,
    Invalidate,
    /// Any operation this crate does not interpret.
    #[serde(untagged)]
    Other(String),
}

impl OperationType {
    /// Wire name of the operation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::Drop => "drop",
            Self::Rename => "rename",
            Self::Invalidate => "invalidate",
            Self::Other(s) => s,
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Database and collection an event was observed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    /// Database name.
    pub db: String,
    /// Collection name. Absent for database-level events.
    #[serde(default)]
    pub coll: String,
}

/// Identifies the document an event refers to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentKey {
    /// Document id, as stored.
    #[serde(rename = "_id", alias = "id")]
    pub id: Value,
}

impl DocumentKey {
    /// Display form of the id.
    ///
    /// Strings render as-is, extended-JSON object ids (`{"$oid": ..}`) as
    /// their hex form, everything else as its JSON text. Distinct ids can
    /// share a display form (`42` and `"42"`), so use `matches` to compare.
    #[must_use]
    pub fn id_string(&self) -> String {
        match &self.id {
            Value::String(s) => s.clone(),
            other => object_id_hex(other).map_or_else(|| other.to_string(), str::to_string),
        }
    }

    /// True if this key identifies `target`. Values compare by type and
    /// content; a string target also matches an object id with that hex form.
    #[must_use]
    pub fn matches(&self, target: &Value) -> bool {
        if self.id == *target {
            return true;
        }
        match (object_id_hex(&self.id), target) {
            (Some(hex), Value::String(s)) => hex == s,
            _ => false,
        }
    }
}

/// Hex form of an extended-JSON object id (`{"$oid": "<hex>"}`).
pub(crate) fn object_id_hex(value: &Value) -> Option<&str> {
    match value {
        Value::Object(map) if map.len() == 1 => map.get("$oid").and_then(Value::as_str),
        _ => None,
    }
}

/// Field-level delta carried by update events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDescription {
    #[allow(missing_docs)]
    #[serde(default)]
    pub updated_fields: serde_json::Map<String, Value>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub removed_fields: Vec<String>,
}

/// One mutation observed on the backing store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// Opaque resume token of the event, if the source provides one.
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<Value>,
    #[allow(missing_docs)]
    pub operation_type: OperationType,
    #[allow(missing_docs)]
    pub ns: Namespace,
    #[allow(missing_docs)]
    pub document_key: DocumentKey,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_document: Option<Value>,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_description: Option<UpdateDescription>,
    /// Ordering token assigned by the source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_time: Option<Value>,
}

impl ChangeEvent {
    /// Minimal event with no document body. Mostly useful in tests and tools.
    #[must_use]
    pub fn new(
        operation_type: OperationType,
        db: impl Into<String>,
        coll: impl Into<String>,
        id: impl Into<Value>,
    ) -> Self {
        Self {
            resume_token: None,
            operation_type,
            ns: Namespace {
                db: db.into(),
                coll: coll.into(),
            },
            document_key: DocumentKey { id: id.into() },
            full_document: None,
            update_description: None,
            cluster_time: None,
        }
    }

    /// Attach a full document body.
    #[must_use]
    pub fn with_full_document(mut self, doc: Value) -> Self {
        self.full_document = Some(doc);
        self
    }

    /// Document used when rendering templates for this event.
    ///
    /// Deletes carry no body, so only the key is available to them.
    #[must_use]
    pub fn render_document(&self) -> Value {
        match &self.full_document {
            Some(doc) => doc.clone(),
            None => serde_json::json!({ "_id": self.document_key.id }),
        }
    }

    /// True if this event targets the given collection and document id.
    #[must_use]
    pub fn targets(&self, collection: &str, document_id: &Value) -> bool {
        self.ns.coll == collection && self.document_key.matches(document_id)
    }
}
