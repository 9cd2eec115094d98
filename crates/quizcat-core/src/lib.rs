//! Core catalog model, record parse boundary and issue taxonomy for quizcat.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "quizcat-core";

/// Upper bound, in characters, for a finalized meta description.
pub const META_DESCRIPTION_MAX_CHARS: usize = 160;

/// Marker appended when a description is cut down to fit the limit.
pub const ELLIPSIS: &str = "...";

/// Identity surface shared by every record kind that flows through set analysis and dedup.
pub trait CatalogEntry {
    fn id(&self) -> &str;
    fn title(&self) -> &str;
    fn number(&self) -> Option<u32>;
    fn set_number(&mut self, number: u32);
}

/// Parse boundary from one raw collection element into a typed record.
///
/// `position` is the 1-based array position of the element; record kinds that
/// carry a sequence number fall back to it when the source omits one.
pub trait FromRecordValue: Sized {
    fn from_record_value(position: usize, value: JsonValue) -> Result<Self, RecordDefect>;
}

/// Why a single collection element could not become a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RecordDefect {
    #[error("entry is not a JSON object")]
    NotAnObject,
    #[error("entry has no id")]
    MissingId,
    #[error("entry id is a JSON {found}, expected a string")]
    InvalidId { found: String },
    #[error("entry has no {field}")]
    MissingField { field: String },
}

/// Conditions that abort the pass that hit them.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("{collection} unavailable at {path}: {reason}")]
    SourceUnavailable {
        collection: String,
        path: String,
        reason: String,
    },
}

/// Conditions that are reported (and corrected where a safe rule exists) but never abort a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CatalogIssue {
    #[error("{collection}[{index}] skipped: {defect}")]
    MalformedRecord {
        collection: String,
        index: usize,
        defect: RecordDefect,
    },
    #[error("id {id} appears {count} times in {collection}")]
    DuplicateIdentifier {
        collection: String,
        id: String,
        count: usize,
    },
    #[error("id {id} is missing from every available source")]
    RecoveryGap { id: String },
    #[error("build output {id} has no content store record")]
    OrphanedOutput { id: String },
    #[error("description generation failed for {id}: {reason}")]
    GenerationFailure { id: String, reason: String },
    #[error("description generation rate limited for {id} (attempt {attempt})")]
    RateLimited { id: String, attempt: usize },
}

/// Registry row: the authoritative `{number, id, title}` triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub number: u32,
    pub id: String,
    pub title: String,
}

impl RegistryEntry {
    pub fn new(number: u32, id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            number,
            id: id.into(),
            title: title.into(),
        }
    }
}

impl CatalogEntry for RegistryEntry {
    fn id(&self) -> &str {
        &self.id
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn number(&self) -> Option<u32> {
        Some(self.number)
    }

    fn set_number(&mut self, number: u32) {
        self.number = number;
    }
}

impl FromRecordValue for RegistryEntry {
    fn from_record_value(position: usize, value: JsonValue) -> Result<Self, RecordDefect> {
        let mut object = into_object(value)?;
        let id = take_id(&mut object)?;
        let number = take_number(&mut object).unwrap_or(position as u32);
        let title = take_string(&mut object, "title").unwrap_or_default();
        Ok(Self { number, id, title })
    }
}

/// Full quiz object as served by the site. Fields the catalog does not
/// interpret (questions, category, tags, difficulty, ...) ride along in `extra`,
/// as do interpreted fields whose source value is unusable (a blank
/// `metaDescription`, a non-positive `number`), so a rewrite leaves them as found.
#[derive(Debug, Clone, PartialEq)]
pub struct QuizRecord {
    pub id: String,
    pub number: Option<u32>,
    pub title: String,
    pub meta_description: Option<String>,
    pub extra: Map<String, JsonValue>,
    layout: Vec<String>,
}

/// Serialization order for interpreted fields the source object did not carry.
const QUIZ_FIELDS: [&str; 4] = ["id", "number", "title", "metaDescription"];

impl QuizRecord {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            number: None,
            title: title.into(),
            meta_description: None,
            extra: Map::new(),
            layout: Vec::new(),
        }
    }

    pub fn with_meta_description(mut self, meta_description: impl Into<String>) -> Self {
        self.meta_description = Some(meta_description.into());
        self
    }

    pub fn with_extra(mut self, key: &str, value: JsonValue) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    fn interpreted(&self, key: &str) -> Option<JsonValue> {
        match key {
            "id" => Some(JsonValue::String(self.id.clone())),
            "number" => self.number.map(JsonValue::from),
            "title" if !self.title.is_empty() => Some(JsonValue::String(self.title.clone())),
            "metaDescription" => self.meta_description.clone().map(JsonValue::String),
            _ => None,
        }
    }

    /// Object form in the source key order. Keys the source lacked follow, interpreted
    /// fields first. An interpreted value wins over a raw one kept under the same key.
    fn to_object(&self) -> Map<String, JsonValue> {
        let keys = self
            .layout
            .iter()
            .map(String::as_str)
            .chain(QUIZ_FIELDS)
            .chain(self.extra.keys().map(String::as_str));
        let mut object = Map::with_capacity(self.extra.len() + QUIZ_FIELDS.len());
        for key in keys {
            if object.contains_key(key) {
                continue;
            }
            if let Some(value) = self.interpreted(key).or_else(|| self.extra.get(key).cloned()) {
                object.insert(key.to_string(), value);
            }
        }
        object
    }
}

impl Serialize for QuizRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_object().serialize(serializer)
    }
}

impl CatalogEntry for QuizRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn number(&self) -> Option<u32> {
        self.number
    }

    fn set_number(&mut self, number: u32) {
        self.number = Some(number);
    }
}

impl FromRecordValue for QuizRecord {
    fn from_record_value(_position: usize, value: JsonValue) -> Result<Self, RecordDefect> {
        let mut object = into_object(value)?;
        let layout = object.keys().cloned().collect();
        let id = take_id(&mut object)?;
        let number = take_where(&mut object, "number", positive_number);
        let title = take_where(&mut object, "title", non_blank_string).unwrap_or_default();
        let meta_description = take_where(&mut object, "metaDescription", non_blank_string);
        Ok(Self {
            id,
            number,
            title,
            meta_description,
            extra: object,
            layout,
        })
    }
}

/// One row of the generated description collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptionEntry {
    pub id: String,
    pub title: String,
    pub meta_description: String,
    pub length: usize,
}

impl DescriptionEntry {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        meta_description: impl Into<String>,
    ) -> Self {
        let meta_description = meta_description.into();
        Self {
            id: id.into(),
            title: title.into(),
            length: meta_description.chars().count(),
            meta_description,
        }
    }
}

impl CatalogEntry for DescriptionEntry {
    fn id(&self) -> &str {
        &self.id
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn number(&self) -> Option<u32> {
        None
    }

    fn set_number(&mut self, _number: u32) {}
}

impl FromRecordValue for DescriptionEntry {
    fn from_record_value(_position: usize, value: JsonValue) -> Result<Self, RecordDefect> {
        let mut object = into_object(value)?;
        let id = take_id(&mut object)?;
        let title = take_string(&mut object, "title").unwrap_or_default();
        let meta_description =
            take_string(&mut object, "meta_description").ok_or_else(|| RecordDefect::MissingField {
                field: "meta_description".to_string(),
            })?;
        // `length` in the source is advisory; it is recomputed from the text.
        Ok(Self::new(id, title, meta_description))
    }
}

/// Ordered records of one named collection plus the entries that failed the parse boundary.
///
/// `rejected` keeps each failed entry verbatim with its source index so a pass that
/// rewrites the collection can put it back where it was.
#[derive(Debug, Clone)]
pub struct LoadedCollection<T> {
    pub name: String,
    pub records: Vec<T>,
    pub malformed: Vec<CatalogIssue>,
    pub rejected: Vec<(usize, JsonValue)>,
}

impl<T: FromRecordValue> LoadedCollection<T> {
    pub fn from_values(name: impl Into<String>, values: Vec<JsonValue>) -> Self {
        let name = name.into();
        let mut records = Vec::with_capacity(values.len());
        let mut malformed = Vec::new();
        let mut rejected = Vec::new();
        for (index, value) in values.into_iter().enumerate() {
            match T::from_record_value(index + 1, value.clone()) {
                Ok(record) => records.push(record),
                Err(defect) => {
                    malformed.push(CatalogIssue::MalformedRecord {
                        collection: name.clone(),
                        index,
                        defect,
                    });
                    rejected.push((index, value));
                }
            }
        }
        Self {
            name,
            records,
            malformed,
            rejected,
        }
    }
}

/// Serialize `records` and reinsert every rejected entry at its source index,
/// clamped to the end when the collection has shrunk.
pub fn with_rejected<R: Serialize>(
    records: &[R],
    rejected: &[(usize, JsonValue)],
) -> serde_json::Result<Vec<JsonValue>> {
    let mut values = records
        .iter()
        .map(serde_json::to_value)
        .collect::<serde_json::Result<Vec<_>>>()?;
    let mut rejected: Vec<&(usize, JsonValue)> = rejected.iter().collect();
    rejected.sort_by_key(|(index, _)| *index);
    for (index, value) in rejected {
        values.insert((*index).min(values.len()), value.clone());
    }
    Ok(values)
}

impl<T: CatalogEntry> LoadedCollection<T> {
    pub fn ids(&self) -> BTreeSet<String> {
        self.records.iter().map(|r| r.id().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn into_object(value: JsonValue) -> Result<Map<String, JsonValue>, RecordDefect> {
    match value {
        JsonValue::Object(object) => Ok(object),
        _ => Err(RecordDefect::NotAnObject),
    }
}

fn take_id(object: &mut Map<String, JsonValue>) -> Result<String, RecordDefect> {
    match object.shift_remove("id") {
        None | Some(JsonValue::Null) => Err(RecordDefect::MissingId),
        Some(JsonValue::String(id)) if id.trim().is_empty() => Err(RecordDefect::MissingId),
        Some(JsonValue::String(id)) => Ok(id),
        Some(other) => Err(RecordDefect::InvalidId {
            found: json_kind(&other).to_string(),
        }),
    }
}

fn take_number(object: &mut Map<String, JsonValue>) -> Option<u32> {
    object.shift_remove("number").as_ref().and_then(positive_number)
}

/// Remove `key` only when `interpret` accepts its value; anything else stays in place.
fn take_where<T>(
    object: &mut Map<String, JsonValue>,
    key: &str,
    interpret: impl Fn(&JsonValue) -> Option<T>,
) -> Option<T> {
    let interpreted = object.get(key).and_then(interpret)?;
    object.shift_remove(key);
    Some(interpreted)
}

fn positive_number(value: &JsonValue) -> Option<u32> {
    value
        .as_u64()
        .filter(|n| *n > 0)
        .and_then(|n| u32::try_from(n).ok())
}

fn non_blank_string(value: &JsonValue) -> Option<String> {
    value
        .as_str()
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}

fn take_string(object: &mut Map<String, JsonValue>, key: &str) -> Option<String> {
    match object.shift_remove(key) {
        Some(JsonValue::String(s)) => Some(s),
        _ => None,
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
