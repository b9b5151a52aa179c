//! JavaScript surface: `DraftStore` and `Autosave` classes.
//!
//! Drafts cross the boundary as plain objects:
//! ```text
//! { id, type, subject?, channels?, content?: { text?, audio?: Blob, files?: File[] },
//!   createdAt, updatedAt, status, protocol? }
//! ```
//! Rejected promises carry an `Error` whose `name` is `StorageUnavailable` when
//! the browser has no IndexedDB, so callers can fall back to in-memory editing.

use crate::autosave::{AutosaveController, AutosaveSettings, AutosaveStatus, BrowserScheduler};
use crate::data::web::{read_blob, read_file, to_web_blob, to_web_file};
use crate::data::{
    Channel, ComplaintType, Draft, DraftError, DraftField, DraftFields, DraftId, DraftRepository,
    DraftStatus, LocalStorageStore, Subject,
};
use crate::storage::{IndexedDbStore, StorageConfig};
use chrono::{DateTime, SecondsFormat, Utc};
use js_sys::{Array, Object, Promise, Reflect};
use std::collections::BTreeSet;
use std::rc::Rc;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::future_to_promise;

fn to_js_error(error: DraftError) -> JsValue {
    let js = js_sys::Error::new(&error.to_string());
    let name = match &error {
        e if e.is_unavailable() => "StorageUnavailable",
        DraftError::Codec(_) => "CodecError",
        DraftError::Rejected(_) => "SubmissionRejected",
        _ => "DraftError",
    };
    js.set_name(name);
    js.into()
}

fn get(obj: &JsValue, key: &str) -> Result<JsValue, JsValue> {
    Reflect::get(obj, &JsValue::from_str(key))
}

fn set(obj: &Object, key: &str, value: &JsValue) -> Result<(), JsValue> {
    Reflect::set(obj, &JsValue::from_str(key), value).map(|_| ())
}

fn present(value: JsValue) -> Option<JsValue> {
    (!value.is_undefined() && !value.is_null()).then_some(value)
}

fn from_js<T: serde::de::DeserializeOwned>(value: JsValue) -> Result<T, JsValue> {
    serde_wasm_bindgen::from_value(value).map_err(|e| JsValue::from_str(&e.to_string()))
}

fn to_js<T: serde::Serialize>(value: &T) -> Result<JsValue, JsValue> {
    value
        .serialize(&serde_wasm_bindgen::Serializer::json_compatible())
        .map_err(|e| JsValue::from_str(&e.to_string()))
}

fn iso(at: &DateTime<Utc>) -> JsValue {
    JsValue::from_str(&at.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn parse_timestamp(value: JsValue) -> Option<DateTime<Utc>> {
    let text = value.as_string()?;
    DateTime::parse_from_rfc3339(&text)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Reads a non-binary field. Returns `None` for the binary paths.
fn scalar_field(path: &str, value: Option<JsValue>) -> Result<Option<DraftField>, JsValue> {
    let field = match path {
        "type" => DraftField::Type(value.map(from_js::<ComplaintType>).transpose()?),
        "subject" => DraftField::Subject(value.map(from_js::<Subject>).transpose()?),
        "channels" => {
            let channels: Vec<Channel> = value.map(from_js).transpose()?.unwrap_or_default();
            DraftField::Channels(channels.into_iter().collect::<BTreeSet<_>>())
        }
        "content.text" => DraftField::Text(value.and_then(|v| v.as_string())),
        "content.audio" | "content.files" => return Ok(None),
        other => return Err(JsValue::from_str(&format!("unknown field path '{}'", other))),
    };
    Ok(Some(field))
}

/// Reads one field value for a logical path. Binaries are read from their
/// `Blob`/`File` objects.
async fn field_from_js(path: &str, value: JsValue) -> Result<DraftField, JsValue> {
    let value = present(value);
    if let Some(field) = scalar_field(path, value.clone())? {
        return Ok(field);
    }
    if path == "content.audio" {
        return match value {
            Some(audio) => {
                let blob: web_sys::Blob = audio.dyn_into()?;
                let audio = read_blob(&blob).await.map_err(|e| to_js_error(e.into()))?;
                Ok(DraftField::Audio(Some(audio)))
            }
            None => Ok(DraftField::Audio(None)),
        };
    }

    let mut files = Vec::new();
    if let Some(list) = value {
        for entry in Array::from(&list).iter() {
            let file: web_sys::File = entry.dyn_into()?;
            files.push(read_file(&file).await.map_err(|e| to_js_error(e.into()))?);
        }
    }
    Ok(DraftField::Files(files))
}

async fn draft_from_js(value: &JsValue) -> Result<Draft, JsValue> {
    let mut fields = DraftFields::default();
    for path in ["type", "subject", "channels"] {
        fields.apply(field_from_js(path, get(value, path)?).await?);
    }
    if let Some(content) = present(get(value, "content")?) {
        for (key, path) in [
            ("text", "content.text"),
            ("audio", "content.audio"),
            ("files", "content.files"),
        ] {
            fields.apply(field_from_js(path, get(&content, key)?).await?);
        }
    }

    let id = get(value, "id")?
        .as_string()
        .map(DraftId::from)
        .unwrap_or_else(DraftId::generate);
    let mut draft = Draft::new(id, fields);
    if let Some(created_at) = parse_timestamp(get(value, "createdAt")?) {
        draft.created_at = created_at;
    }
    if let Some(updated_at) = parse_timestamp(get(value, "updatedAt")?) {
        draft.touch(updated_at);
    }
    draft.status = match get(value, "status")?.as_string().as_deref() {
        Some("submitted") => DraftStatus::Submitted,
        _ => DraftStatus::Draft,
    };
    draft.protocol = get(value, "protocol")?.as_string();
    Ok(draft)
}

fn draft_to_js(draft: &Draft) -> Result<JsValue, JsValue> {
    let obj = Object::new();
    let fields = &draft.fields;
    set(&obj, "id", &JsValue::from_str(draft.id.as_str()))?;
    set(&obj, "type", &to_js(&fields.complaint_type)?)?;
    if let Some(subject) = &fields.subject {
        set(&obj, "subject", &to_js(subject)?)?;
    }
    if !fields.channels.is_empty() {
        set(&obj, "channels", &to_js(&fields.channels)?)?;
    }

    let content = &fields.content;
    if content.text.is_some() || content.audio.is_some() || !content.files.is_empty() {
        let js_content = Object::new();
        if let Some(text) = &content.text {
            set(&js_content, "text", &JsValue::from_str(text))?;
        }
        if let Some(audio) = &content.audio {
            set(&js_content, "audio", &to_web_blob(audio)?)?;
        }
        if !content.files.is_empty() {
            let files = Array::new();
            for file in &content.files {
                files.push(&to_web_file(file)?);
            }
            set(&js_content, "files", &files)?;
        }
        set(&obj, "content", &js_content)?;
    }

    set(&obj, "createdAt", &iso(&draft.created_at))?;
    set(&obj, "updatedAt", &iso(&draft.updated_at))?;
    set(&obj, "status", &JsValue::from_str(draft.status.as_str()))?;
    if let Some(protocol) = &draft.protocol {
        set(&obj, "protocol", &JsValue::from_str(protocol))?;
    }
    Ok(obj.into())
}

fn drafts_to_js(drafts: &[Draft]) -> Result<JsValue, JsValue> {
    let array = Array::new();
    for draft in drafts {
        array.push(&draft_to_js(draft)?);
    }
    Ok(array.into())
}

fn status_to_js(status: &AutosaveStatus) -> Result<JsValue, JsValue> {
    let obj = Object::new();
    set(&obj, "phase", &JsValue::from_str(status.phase.as_str()))?;
    let draft_id = status
        .draft_id
        .as_ref()
        .map_or(JsValue::NULL, |id| JsValue::from_str(id.as_str()));
    set(&obj, "draftId", &draft_id)?;
    let last_error = status
        .last_error
        .clone()
        .map_or(JsValue::NULL, to_js_error);
    set(&obj, "lastError", &last_error)?;
    let last_saved_at = status.last_saved_at.as_ref().map_or(JsValue::NULL, iso);
    set(&obj, "lastSavedAt", &last_saved_at)?;
    Ok(obj.into())
}

/// Draft repository backed by IndexedDB.
#[wasm_bindgen]
pub struct DraftStore {
    repository: DraftRepository<IndexedDbStore>,
}

#[wasm_bindgen]
impl DraftStore {
    /// Opens the store. Legacy `localStorage` drafts are migrated on first use.
    #[wasm_bindgen(constructor)]
    pub fn new(database_name: Option<String>) -> DraftStore {
        let config = database_name.map(StorageConfig::new).unwrap_or_default();
        let repository = DraftRepository::new(IndexedDbStore::new(config));
        let repository = match LocalStorageStore::open() {
            Ok(legacy) => repository.with_legacy(Rc::new(legacy)),
            Err(e) => {
                log::warn!("Legacy drafts will not be migrated: {}", e);
                repository
            }
        };
        DraftStore { repository }
    }

    #[wasm_bindgen(js_name = isAvailable)]
    pub fn is_available() -> bool {
        IndexedDbStore::is_available()
    }

    #[wasm_bindgen(js_name = saveDraft)]
    pub fn save_draft(&self, draft: JsValue) -> Promise {
        let repository = self.repository.clone();
        future_to_promise(async move {
            let draft = draft_from_js(&draft).await?;
            let id = repository.save_draft(&draft).await.map_err(to_js_error)?;
            Ok(JsValue::from_str(id.as_str()))
        })
    }

    #[wasm_bindgen(js_name = getDrafts)]
    pub fn get_drafts(&self) -> Promise {
        let repository = self.repository.clone();
        future_to_promise(async move {
            let drafts = repository.get_drafts().await.map_err(to_js_error)?;
            drafts_to_js(&drafts)
        })
    }

    #[wasm_bindgen(js_name = getDraft)]
    pub fn get_draft(&self, id: String) -> Promise {
        let repository = self.repository.clone();
        future_to_promise(async move {
            let draft = repository
                .get_draft(&DraftId::from(id))
                .await
                .map_err(to_js_error)?;
            match draft {
                Some(draft) => draft_to_js(&draft),
                None => Ok(JsValue::NULL),
            }
        })
    }

    #[wasm_bindgen(js_name = deleteDraft)]
    pub fn delete_draft(&self, id: String) -> Promise {
        let repository = self.repository.clone();
        future_to_promise(async move {
            repository
                .delete_draft(&DraftId::from(id))
                .await
                .map_err(to_js_error)?;
            Ok(JsValue::UNDEFINED)
        })
    }

    #[wasm_bindgen(js_name = saveSubmitted)]
    pub fn save_submitted(&self, draft: JsValue, protocol: String) -> Promise {
        let repository = self.repository.clone();
        future_to_promise(async move {
            let draft = draft_from_js(&draft).await?;
            repository
                .save_submitted(&draft, &protocol)
                .await
                .map_err(to_js_error)?;
            Ok(JsValue::UNDEFINED)
        })
    }

    #[wasm_bindgen(js_name = getSubmitted)]
    pub fn get_submitted(&self) -> Promise {
        let repository = self.repository.clone();
        future_to_promise(async move {
            let submitted = repository.get_submitted().await.map_err(to_js_error)?;
            drafts_to_js(&submitted)
        })
    }

    #[wasm_bindgen(js_name = clearDrafts)]
    pub fn clear_drafts(&self) -> Promise {
        let repository = self.repository.clone();
        future_to_promise(async move {
            repository.clear_drafts().await.map_err(to_js_error)?;
            Ok(JsValue::UNDEFINED)
        })
    }
}

/// Field-level autosave session.
#[wasm_bindgen]
pub struct Autosave {
    controller: AutosaveController<IndexedDbStore, BrowserScheduler>,
}

#[wasm_bindgen]
impl Autosave {
    #[wasm_bindgen(constructor)]
    pub fn new(store: &DraftStore) -> Autosave {
        Autosave {
            controller: AutosaveController::new(
                store.repository.clone(),
                BrowserScheduler,
                AutosaveSettings::load(),
            ),
        }
    }

    /// Merges a field edit. Text and selections apply before this returns;
    /// audio and files apply once their bytes have been read.
    #[wasm_bindgen(js_name = updateField)]
    pub fn update_field(&self, path: String, value: JsValue) -> Promise {
        match scalar_field(&path, present(value.clone())) {
            Ok(Some(field)) => {
                self.controller.update_field(field);
                Promise::resolve(&JsValue::UNDEFINED)
            }
            Ok(None) => {
                let controller = self.controller.clone();
                future_to_promise(async move {
                    let field = field_from_js(&path, value).await?;
                    controller.update_field(field);
                    Ok(JsValue::UNDEFINED)
                })
            }
            Err(e) => Promise::reject(&e),
        }
    }

    #[wasm_bindgen(js_name = loadDraft)]
    pub fn load_draft(&self, id: String) -> Promise {
        let controller = self.controller.clone();
        future_to_promise(async move {
            let draft = controller
                .load_draft(&DraftId::from(id))
                .await
                .map_err(to_js_error)?;
            match draft {
                Some(draft) => draft_to_js(&draft),
                None => Ok(JsValue::NULL),
            }
        })
    }

    pub fn clear(&self) {
        self.controller.clear();
    }

    /// Persists pending edits now. Call when leaving the form.
    pub fn flush(&self) -> Promise {
        let controller = self.controller.clone();
        future_to_promise(async move {
            controller.flush().await.map_err(to_js_error)?;
            Ok(JsValue::UNDEFINED)
        })
    }

    /// Archives the current draft under the protocol returned by the server.
    #[wasm_bindgen(js_name = markSubmitted)]
    pub fn mark_submitted(&self, protocol: String) -> Promise {
        let controller = self.controller.clone();
        future_to_promise(async move {
            let protocol = controller
                .submit(crate::data::SubmissionOutcome::Accepted { protocol })
                .await
                .map_err(to_js_error)?;
            Ok(JsValue::from_str(&protocol))
        })
    }

    pub fn status(&self) -> Result<JsValue, JsValue> {
        status_to_js(&self.controller.status())
    }
}
