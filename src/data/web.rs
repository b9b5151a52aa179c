//! Conversions between browser `Blob`/`File` objects and draft binaries.

use crate::data::codec::CodecError;
use crate::data::draft::{Blob, FileAttachment};
use wasm_bindgen::JsValue;
use wasm_bindgen_futures::JsFuture;

/// Reads a browser blob into memory.
///
/// Fails with `CodecError::ReadFailed` if the blob was revoked or is unreadable.
pub async fn read_blob(blob: &web_sys::Blob) -> Result<Blob, CodecError> {
    let buffer = JsFuture::from(blob.array_buffer())
        .await
        .map_err(|e| CodecError::ReadFailed(format!("{:?}", e)))?;
    let bytes = js_sys::Uint8Array::new(&buffer).to_vec();
    Ok(Blob::new(bytes, blob.type_()))
}

/// Reads a browser file, keeping its name and modification time.
pub async fn read_file(file: &web_sys::File) -> Result<FileAttachment, CodecError> {
    let blob = read_blob(file).await?;
    Ok(FileAttachment::new(
        file.name(),
        file.last_modified() as i64,
        blob,
    ))
}

fn byte_parts(bytes: &[u8]) -> js_sys::Array {
    let parts = js_sys::Array::new();
    parts.push(&js_sys::Uint8Array::from(bytes));
    parts
}

pub fn to_web_blob(blob: &Blob) -> Result<web_sys::Blob, JsValue> {
    let options = web_sys::BlobPropertyBag::new();
    options.set_type(&blob.mime_type);
    web_sys::Blob::new_with_u8_array_sequence_and_options(&byte_parts(&blob.bytes), &options)
}

pub fn to_web_file(file: &FileAttachment) -> Result<web_sys::File, JsValue> {
    let options = web_sys::FilePropertyBag::new();
    options.set_type(file.mime_type());
    options.set_last_modified(file.last_modified as f64);
    web_sys::File::new_with_u8_array_sequence_and_options(
        &byte_parts(&file.blob.bytes),
        &file.name,
        &options,
    )
}
