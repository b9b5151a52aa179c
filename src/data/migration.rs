//! One-time migration from the legacy flat storage scheme.
//!
//! Earlier versions kept the single in-progress form in `localStorage`, one
//! key per field, with binaries stored as data URLs. The migration moves that
//! form into the `drafts` collection, removes the legacy keys and records its
//! completion under a flag key. Once the flag is set the migration performs
//! no reads of legacy fields and no writes.

use crate::data::codec::{self, CodecError};
use crate::data::draft::{
    Channel, ComplaintType, Draft, DraftField, DraftFields, DraftId, FileAttachment, Subject,
};
use crate::data::repository::{encode_draft, DraftError};
use crate::storage::{RecordStore, StorageError, DRAFTS};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

pub const KEY_TYPE: &str = "manifestacao_tipo";
pub const KEY_SUBJECT: &str = "manifestacao_assunto";
pub const KEY_CHANNELS: &str = "manifestacao_canais";
pub const KEY_TEXT: &str = "manifestacao_texto";
pub const KEY_AUDIO: &str = "manifestacao_audio";
pub const KEY_FILES: &str = "manifestacao_anexos";

/// Legacy field keys, in the order they are read.
pub const LEGACY_KEYS: [&str; 6] = [
    KEY_TYPE,
    KEY_SUBJECT,
    KEY_CHANNELS,
    KEY_TEXT,
    KEY_AUDIO,
    KEY_FILES,
];

/// Flag key recording that the migration finished.
pub const MIGRATION_FLAG_KEY: &str = "ouvidoria_drafts_migrated";
const MIGRATION_FLAG_COMPLETE: &str = "complete";

/// Synchronous string key-value storage holding the legacy scheme
/// (`localStorage` in the browser).
pub trait LegacyStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove_item(&self, key: &str) -> Result<(), StorageError>;
}

/// `window.localStorage`.
#[cfg(target_arch = "wasm32")]
pub struct LocalStorageStore {
    storage: web_sys::Storage,
}

#[cfg(target_arch = "wasm32")]
impl LocalStorageStore {
    pub fn open() -> Result<Self, StorageError> {
        let window = web_sys::window().ok_or(StorageError::Unavailable)?;
        let storage = window
            .local_storage()
            .ok()
            .flatten()
            .ok_or(StorageError::Unavailable)?;
        Ok(Self { storage })
    }
}

#[cfg(target_arch = "wasm32")]
impl LegacyStore for LocalStorageStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.storage
            .get_item(key)
            .map_err(|e| StorageError::Other(format!("{:?}", e)))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.storage
            .set_item(key, value)
            .map_err(|e| StorageError::TransactionFailed(format!("{:?}", e)))
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.storage
            .remove_item(key)
            .map_err(|e| StorageError::TransactionFailed(format!("{:?}", e)))
    }
}

/// In-memory legacy store for native builds and tests.
#[derive(Clone, Default)]
pub struct MemoryLegacyStore {
    items: Rc<RefCell<HashMap<String, String>>>,
    writes: Rc<Cell<u32>>,
}

impl MemoryLegacyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items<'a>(items: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let store = Self::new();
        store.items.borrow_mut().extend(
            items
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );
        store
    }

    /// Number of `set_item`/`remove_item` calls.
    pub fn write_count(&self) -> u32 {
        self.writes.get()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.items.borrow().contains_key(key)
    }
}

impl LegacyStore for MemoryLegacyStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.items.borrow().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.writes.set(self.writes.get() + 1);
        self.items
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.writes.set(self.writes.get() + 1);
        self.items.borrow_mut().remove(key);
        Ok(())
    }
}

/// Persisted migration record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    NotRun,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub state: MigrationState,
    /// Drafts written by this run (0 when the migration had already completed).
    pub migrated_drafts: u32,
}

/// Legacy attachment entry: metadata plus a data URL.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyAttachment {
    name: String,
    #[serde(default, rename = "type")]
    mime_type: Option<String>,
    #[serde(default)]
    last_modified: i64,
    data_url: String,
}

/// The flag-gated legacy transfer routine.
#[derive(Clone)]
pub struct LegacyMigration {
    legacy: Rc<dyn LegacyStore>,
}

impl LegacyMigration {
    pub fn new(legacy: Rc<dyn LegacyStore>) -> Self {
        Self { legacy }
    }

    pub fn state(&self) -> Result<MigrationState, StorageError> {
        let flag = self.legacy.get_item(MIGRATION_FLAG_KEY)?;
        Ok(match flag.as_deref() {
            Some(MIGRATION_FLAG_COMPLETE) => MigrationState::Complete,
            _ => MigrationState::NotRun,
        })
    }

    /// Runs the migration unless the flag says it already completed.
    ///
    /// The legacy keys are removed before the flag is set, so an interrupted
    /// run that already wrote the draft does not write it a second time.
    pub async fn run<S: RecordStore>(&self, store: &S) -> Result<MigrationReport, DraftError> {
        if self.state()? == MigrationState::Complete {
            return Ok(MigrationReport {
                state: MigrationState::Complete,
                migrated_drafts: 0,
            });
        }

        let mut migrated_drafts = 0;
        if let Some(fields) = self.read_legacy_fields()? {
            let draft = Draft::new(DraftId::generate(), fields);
            store.put(DRAFTS, &encode_draft(&draft)).await?;
            log::info!("Migrated legacy draft into {}", draft.id);
            migrated_drafts += 1;
        }

        for key in LEGACY_KEYS {
            self.legacy.remove_item(key)?;
        }
        self.legacy
            .set_item(MIGRATION_FLAG_KEY, MIGRATION_FLAG_COMPLETE)?;

        Ok(MigrationReport {
            state: MigrationState::Complete,
            migrated_drafts,
        })
    }

    /// Reads the flat legacy keys. Returns `None` when they hold nothing
    /// worth keeping. Unreadable values are skipped with a warning.
    fn read_legacy_fields(&self) -> Result<Option<DraftFields>, StorageError> {
        let mut fields = DraftFields::default();

        if let Some(raw) = self.legacy.get_item(KEY_TYPE)? {
            let parsed = parse_json::<ComplaintType>(&raw)
                .or_else(|| parse_json(&serde_json::Value::String(raw.clone()).to_string()));
            match parsed {
                Some(kind) => fields.apply(DraftField::Type(Some(kind))),
                None => log::warn!("Skipping unknown legacy complaint type {:?}", raw),
            }
        }
        if let Some(raw) = self.legacy.get_item(KEY_SUBJECT)? {
            match parse_json::<Subject>(&raw) {
                Some(subject) => fields.apply(DraftField::Subject(Some(subject))),
                None => log::warn!("Skipping unreadable legacy subject"),
            }
        }
        if let Some(raw) = self.legacy.get_item(KEY_CHANNELS)? {
            match parse_json::<Vec<Channel>>(&raw) {
                Some(channels) => {
                    fields.apply(DraftField::Channels(channels.into_iter().collect::<BTreeSet<_>>()))
                }
                None => log::warn!("Skipping unreadable legacy channel list"),
            }
        }
        if let Some(text) = self.legacy.get_item(KEY_TEXT)? {
            fields.apply(DraftField::Text(Some(text)));
        }
        if let Some(raw) = self.legacy.get_item(KEY_AUDIO)? {
            match codec::decode_data_url(&raw) {
                Ok(audio) => fields.apply(DraftField::Audio(Some(audio))),
                Err(e) => log::warn!("Skipping legacy audio: {}", e),
            }
        }
        if let Some(raw) = self.legacy.get_item(KEY_FILES)? {
            match parse_json::<Vec<LegacyAttachment>>(&raw) {
                Some(entries) => {
                    let files = entries
                        .into_iter()
                        .filter_map(|entry| match legacy_attachment(&entry) {
                            Ok(file) => Some(file),
                            Err(e) => {
                                log::warn!("Skipping legacy attachment {}: {}", entry.name, e);
                                None
                            }
                        })
                        .collect();
                    fields.apply(DraftField::Files(files));
                }
                None => log::warn!("Skipping unreadable legacy attachment list"),
            }
        }

        Ok(fields.is_meaningful().then_some(fields))
    }
}

fn legacy_attachment(entry: &LegacyAttachment) -> Result<FileAttachment, CodecError> {
    let mut blob = codec::decode_data_url(&entry.data_url)?;
    if blob.mime_type == codec::FALLBACK_MIME_TYPE {
        if let Some(mime_type) = entry.mime_type.as_ref().filter(|m| !m.is_empty()) {
            blob.mime_type = mime_type.clone();
        }
    }
    Ok(FileAttachment::new(entry.name.clone(), entry.last_modified, blob))
}

fn parse_json<T: DeserializeOwned>(raw: &str) -> Option<T> {
    serde_json::from_str(raw).ok()
}
