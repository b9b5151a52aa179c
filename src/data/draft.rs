//! Core draft types.
//!
//! - `DraftId`: client-generated record identifier
//! - `Draft`: runtime view of a complaint, with binaries as raw bytes
//! - `DraftFields`: the editable part of a draft, used as the autosave accumulator
//! - `DraftField`: a single field-level update
//! - `DraftRecord`: the persisted shape, with binaries base64-encoded by the codec

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Client-generated draft identifier.
///
/// Time-ordered: a UUIDv7 carries the creation millisecond followed by random
/// bits, so ids never collide between tabs and sort by creation time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DraftId(pub String);

impl DraftId {
    pub fn generate() -> Self {
        Self(format!("draft_{}", uuid::Uuid::now_v7().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DraftId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DraftId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DraftId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Complaint category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplaintType {
    Reclamacao,
    Denuncia,
    Elogio,
    Sugestao,
    Solicitacao,
}

/// Subject selected from the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub id: String,
    pub name: String,
}

impl Subject {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Submission format chosen by the citizen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Text,
    Audio,
    Files,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DraftStatus {
    #[default]
    Draft,
    Submitted,
}

impl DraftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DraftStatus::Draft => "draft",
            DraftStatus::Submitted => "submitted",
        }
    }
}

/// An opaque binary payload with its mime type (e.g. a recorded audio clip).
#[derive(Clone, PartialEq, Eq)]
pub struct Blob {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl Blob {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("mime_type", &self.mime_type)
            .field("size", &self.bytes.len())
            .finish()
    }
}

/// An uploaded file: a binary payload plus the metadata a browser `File` carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttachment {
    pub name: String,
    /// Milliseconds since the Unix epoch, as reported by `File.lastModified`.
    pub last_modified: i64,
    pub blob: Blob,
}

impl FileAttachment {
    pub fn new(name: impl Into<String>, last_modified: i64, blob: Blob) -> Self {
        Self {
            name: name.into(),
            last_modified,
            blob,
        }
    }

    pub fn mime_type(&self) -> &str {
        &self.blob.mime_type
    }

    pub fn size(&self) -> u64 {
        self.blob.size()
    }
}

/// The free-form body of a complaint.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DraftContent {
    pub text: Option<String>,
    pub audio: Option<Blob>,
    pub files: Vec<FileAttachment>,
}

impl DraftContent {
    /// True when there is no non-blank text, no audio and no files.
    pub fn is_empty(&self) -> bool {
        self.text.as_deref().map_or(true, |t| t.trim().is_empty())
            && self.audio.is_none()
            && self.files.is_empty()
    }
}

/// One field-level update, keyed by logical path.
#[derive(Debug, Clone, PartialEq)]
pub enum DraftField {
    Type(Option<ComplaintType>),
    Subject(Option<Subject>),
    Channels(BTreeSet<Channel>),
    Text(Option<String>),
    Audio(Option<Blob>),
    Files(Vec<FileAttachment>),
}

impl DraftField {
    pub fn path(&self) -> &'static str {
        match self {
            DraftField::Type(_) => "type",
            DraftField::Subject(_) => "subject",
            DraftField::Channels(_) => "channels",
            DraftField::Text(_) => "content.text",
            DraftField::Audio(_) => "content.audio",
            DraftField::Files(_) => "content.files",
        }
    }
}

/// The user-editable part of a draft.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DraftFields {
    pub complaint_type: Option<ComplaintType>,
    pub subject: Option<Subject>,
    pub channels: BTreeSet<Channel>,
    pub content: DraftContent,
}

impl DraftFields {
    /// Merges one update; only the field's own path changes.
    pub fn apply(&mut self, field: DraftField) {
        match field {
            DraftField::Type(value) => self.complaint_type = value,
            DraftField::Subject(value) => self.subject = value,
            DraftField::Channels(value) => self.channels = value,
            DraftField::Text(value) => self.content.text = value,
            DraftField::Audio(value) => self.content.audio = value,
            DraftField::Files(value) => self.content.files = value,
        }
    }

    /// A draft with no type, no channels and empty content is never persisted.
    pub fn is_meaningful(&self) -> bool {
        self.complaint_type.is_some() || !self.channels.is_empty() || !self.content.is_empty()
    }
}

/// A complaint draft as seen by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub id: DraftId,
    pub fields: DraftFields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: DraftStatus,
    /// Server-issued tracking code, present once submitted.
    pub protocol: Option<String>,
}

impl Draft {
    /// A fresh draft stamped with the current time.
    pub fn new(id: DraftId, fields: DraftFields) -> Self {
        let now = Utc::now();
        Self {
            id,
            fields,
            created_at: now,
            updated_at: now,
            status: DraftStatus::Draft,
            protocol: None,
        }
    }

    pub fn is_meaningful(&self) -> bool {
        self.fields.is_meaningful()
    }

    /// Advances `updated_at` to `now`, never before `created_at`.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now.max(self.created_at);
    }
}

/// Persisted record layout, shared by the `drafts` and `submitted` collections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftRecord {
    pub id: String,
    #[serde(rename = "type", default)]
    pub complaint_type: Option<ComplaintType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Subject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<Channel>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<StoredContent>,
    #[serde(with = "iso_millis")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "iso_millis")]
    pub updated_at: DateTime<Utc>,
    pub status: DraftStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// Persisted `content` sub-object with binaries encoded as base64 text.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<StoredFile>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub name: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub size: u64,
    pub base64: String,
    pub last_modified: i64,
}

/// Serde helper for ISO-8601 timestamps with millisecond precision, the
/// format produced by JavaScript's `Date.prototype.toISOString`.
pub mod iso_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|d| d.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_generated_ids_are_unique_and_prefixed() {
        let a = DraftId::generate();
        let b = DraftId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("draft_"));
    }

    #[test]
    fn test_meaningful_fields() {
        let mut fields = DraftFields::default();
        assert!(!fields.is_meaningful());

        // A subject alone, or blank text, does not make a draft worth keeping.
        fields.apply(DraftField::Subject(Some(Subject::new("12", "Iluminação"))));
        fields.apply(DraftField::Text(Some("   ".to_string())));
        assert!(!fields.is_meaningful());

        fields.apply(DraftField::Text(Some("Buraco na rua X".to_string())));
        assert!(fields.is_meaningful());

        fields.apply(DraftField::Text(None));
        fields.apply(DraftField::Channels(BTreeSet::from([Channel::Audio])));
        assert!(fields.is_meaningful());
        assert_eq!(fields.subject.as_ref().map(|s| s.id.as_str()), Some("12"));
    }

    #[test]
    fn test_record_wire_format() {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 12, 30, 0).unwrap();
        let record = DraftRecord {
            id: "draft_1".to_string(),
            complaint_type: None,
            subject: None,
            channels: Some(vec![Channel::Text]),
            content: Some(StoredContent {
                text: Some("oi".to_string()),
                ..StoredContent::default()
            }),
            created_at: at,
            updated_at: at,
            status: DraftStatus::Draft,
            protocol: None,
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": "draft_1",
                "type": null,
                "channels": ["text"],
                "content": { "text": "oi" },
                "createdAt": "2025-03-01T12:30:00.000Z",
                "updatedAt": "2025-03-01T12:30:00.000Z",
                "status": "draft"
            })
        );

        let back: DraftRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_touch_never_precedes_creation() {
        let created = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap();
        let mut draft = Draft::new(DraftId::from("d"), DraftFields::default());
        draft.created_at = created;
        draft.touch(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(draft.updated_at, created);
    }
}
