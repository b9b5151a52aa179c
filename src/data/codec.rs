//! Binary serialization codec.
//!
//! Converts audio clips and uploaded files to and from base64 so they fit in a
//! JSON-shaped record, carrying file metadata alongside the encoded payload.

use crate::data::draft::{Blob, DraftContent, FileAttachment, StoredContent, StoredFile};
use base64::{engine::general_purpose::STANDARD, Engine};

/// Mime type used when a legacy payload or record carries none.
pub const FALLBACK_MIME_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(String),
    #[error("malformed data URL")]
    InvalidDataUrl,
    #[error("file {name} decoded to {actual} bytes, expected {expected}")]
    SizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },
    /// The source object could not be read (revoked or unreadable blob).
    #[error("failed to read binary payload: {0}")]
    ReadFailed(String),
}

pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode(text: &str, mime_type: &str) -> Result<Blob, CodecError> {
    let bytes = STANDARD
        .decode(text)
        .map_err(|e| CodecError::InvalidBase64(e.to_string()))?;
    Ok(Blob::new(bytes, mime_type))
}

/// Decodes a `data:<mime>;base64,<payload>` URL.
pub fn decode_data_url(url: &str) -> Result<Blob, CodecError> {
    let rest = url.strip_prefix("data:").ok_or(CodecError::InvalidDataUrl)?;
    let (header, payload) = rest.split_once(',').ok_or(CodecError::InvalidDataUrl)?;
    let mime_type = header
        .strip_suffix(";base64")
        .ok_or(CodecError::InvalidDataUrl)?;
    // Parameters such as ";codecs=opus" stay part of the mime type.
    let mime_type = if mime_type.is_empty() {
        FALLBACK_MIME_TYPE
    } else {
        mime_type
    };
    decode(payload, mime_type)
}

pub fn encode_file(file: &FileAttachment) -> StoredFile {
    StoredFile {
        name: file.name.clone(),
        mime_type: file.blob.mime_type.clone(),
        size: file.size(),
        base64: encode(&file.blob.bytes),
        last_modified: file.last_modified,
    }
}

pub fn decode_file(stored: &StoredFile) -> Result<FileAttachment, CodecError> {
    let blob = decode(&stored.base64, &stored.mime_type)?;
    if blob.size() != stored.size {
        return Err(CodecError::SizeMismatch {
            name: stored.name.clone(),
            expected: stored.size,
            actual: blob.size(),
        });
    }
    Ok(FileAttachment::new(stored.name.clone(), stored.last_modified, blob))
}

/// Encodes the content aggregate. Text passes through untouched; absent audio
/// and an empty file list are omitted rather than encoded.
pub fn encode_content(content: &DraftContent) -> StoredContent {
    StoredContent {
        text: content.text.clone(),
        audio_base64: content.audio.as_ref().map(|a| encode(&a.bytes)),
        audio_type: content.audio.as_ref().map(|a| a.mime_type.clone()),
        files: (!content.files.is_empty())
            .then(|| content.files.iter().map(encode_file).collect()),
    }
}

pub fn decode_content(stored: &StoredContent) -> Result<DraftContent, CodecError> {
    let audio = match &stored.audio_base64 {
        Some(data) => {
            let mime_type = stored.audio_type.as_deref().unwrap_or(FALLBACK_MIME_TYPE);
            Some(decode(data, mime_type)?)
        }
        None => None,
    };
    let files = stored
        .files
        .iter()
        .flatten()
        .map(decode_file)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(DraftContent {
        text: stored.text.clone(),
        audio,
        files,
    })
}
