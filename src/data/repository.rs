//! Draft repository: typed CRUD over the `drafts` and `submitted` collections.
//!
//! The repository hides the codec and the storage engine. Every public
//! operation first opens the store and then passes the legacy migration gate,
//! which runs at most once per repository (and is a no-op once its flag is
//! set).
//!
//! ## Lifecycle
//!
//! 1. `save_draft` overwrites the record with the draft's id
//! 2. `save_submitted` writes an immutable copy to `submitted`, then deletes
//!    the draft. A failed delete leaves a duplicate rather than losing data.

use crate::data::codec::{self, CodecError};
use crate::data::draft::{Draft, DraftContent, DraftFields, DraftId, DraftRecord, DraftStatus};
use crate::data::migration::{LegacyMigration, LegacyStore, MigrationReport};
use crate::storage::{InitCell, RecordStore, StorageError, DRAFTS, INDEX_PROTOCOL, SUBMITTED};
use chrono::Utc;
use serde_json::Value;
use std::rc::Rc;

/// Errors surfaced by repository operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DraftError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("refusing to persist a draft with no type, channels or content")]
    EmptyDraft,
    #[error("a submitted draft needs a protocol")]
    MissingProtocol,
    #[error("submission rejected: {0}")]
    Rejected(String),
}

impl DraftError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, DraftError::Storage(e) if e.is_unavailable())
    }
}

/// Outcome of the server-side submission action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Accepted { protocol: String },
    Rejected { reason: String },
}

/// Domain-level persistence of drafts.
#[derive(Clone)]
pub struct DraftRepository<S> {
    store: S,
    migration: Option<LegacyMigration>,
    migrated: InitCell<()>,
}

impl<S: RecordStore + Clone + 'static> DraftRepository<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            migration: None,
            migrated: InitCell::new(),
        }
    }

    /// Attaches the legacy store; its contents are migrated before the first
    /// read or write.
    pub fn with_legacy(mut self, legacy: Rc<dyn LegacyStore>) -> Self {
        self.migration = Some(LegacyMigration::new(legacy));
        self
    }

    /// Gets the underlying store for direct operations.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs the legacy migration explicitly.
    ///
    /// Idempotent: once the flag is set, later calls report zero drafts and
    /// write nothing.
    pub async fn migrate(&self) -> Result<Option<MigrationReport>, DraftError> {
        self.store.init().await?;
        match &self.migration {
            Some(migration) => migration.run(&self.store).await.map(Some),
            None => Ok(None),
        }
    }

    /// Opens the store and runs the migration gate once.
    ///
    /// Migration failures are logged and swallowed; they never block access to
    /// already-structured data.
    async fn ensure_ready(&self) -> Result<(), DraftError> {
        self.store.init().await?;
        let Some(migration) = self.migration.clone() else {
            return Ok(());
        };
        let store = self.store.clone();
        self.migrated
            .get_or_init(move || async move {
                match migration.run(&store).await {
                    Ok(report) if report.migrated_drafts > 0 => {
                        log::info!("Legacy migration moved {} draft(s)", report.migrated_drafts);
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("Legacy migration failed, will retry next session: {}", e),
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    // ========================================================================
    // Drafts
    // ========================================================================

    /// Persists a draft under its id, overwriting any previous version, and
    /// returns the id. `updatedAt` is refreshed.
    pub async fn save_draft(&self, draft: &Draft) -> Result<DraftId, DraftError> {
        if !draft.is_meaningful() {
            return Err(DraftError::EmptyDraft);
        }
        self.ensure_ready().await?;

        let mut draft = draft.clone();
        draft.status = DraftStatus::Draft;
        draft.protocol = None;
        draft.touch(Utc::now());

        self.store.put(DRAFTS, &encode_draft(&draft)).await?;
        log::debug!("Saved draft {}", draft.id);
        Ok(draft.id)
    }

    /// Lists drafts, most recently updated first.
    pub async fn get_drafts(&self) -> Result<Vec<Draft>, DraftError> {
        self.ensure_ready().await?;
        let records: Vec<Value> = self.store.get_all(DRAFTS).await?;
        let mut drafts = decode_records(records);
        drafts.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(drafts)
    }

    pub async fn get_draft(&self, id: &DraftId) -> Result<Option<Draft>, DraftError> {
        self.ensure_ready().await?;
        let record: Option<DraftRecord> = self.store.get(DRAFTS, id.as_str()).await?;
        Ok(record.map(decode_draft).transpose()?)
    }

    /// Deletes a draft. Deleting a missing draft is not an error.
    pub async fn delete_draft(&self, id: &DraftId) -> Result<(), DraftError> {
        self.ensure_ready().await?;
        self.store.delete(DRAFTS, id.as_str()).await?;
        Ok(())
    }

    /// Removes every draft.
    pub async fn clear_drafts(&self) -> Result<(), DraftError> {
        self.ensure_ready().await?;
        self.store.clear(DRAFTS).await?;
        log::info!("Cleared all drafts");
        Ok(())
    }

    // ========================================================================
    // Submissions
    // ========================================================================

    /// Archives a draft as submitted under the server-issued protocol, then
    /// removes it from `drafts`.
    pub async fn save_submitted(&self, draft: &Draft, protocol: &str) -> Result<(), DraftError> {
        if !draft.is_meaningful() {
            return Err(DraftError::EmptyDraft);
        }
        let protocol = protocol.trim();
        if protocol.is_empty() {
            return Err(DraftError::MissingProtocol);
        }
        self.ensure_ready().await?;

        let mut submitted = draft.clone();
        submitted.status = DraftStatus::Submitted;
        submitted.protocol = Some(protocol.to_string());
        submitted.touch(Utc::now());

        self.store.put(SUBMITTED, &encode_draft(&submitted)).await?;

        if let Err(e) = self.store.delete(DRAFTS, draft.id.as_str()).await {
            log::warn!(
                "Submitted {} as {} but could not remove the draft: {}",
                draft.id,
                protocol,
                e
            );
        }
        log::info!("Archived draft {} with protocol {}", draft.id, protocol);
        Ok(())
    }

    /// Lists submissions, most recent first.
    pub async fn get_submitted(&self) -> Result<Vec<Draft>, DraftError> {
        self.ensure_ready().await?;
        let records: Vec<Value> = self.store.get_all(SUBMITTED).await?;
        let mut submitted = decode_records(records);
        submitted.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(submitted)
    }

    /// Looks up a submission by its protocol.
    pub async fn find_submitted(&self, protocol: &str) -> Result<Option<Draft>, DraftError> {
        self.ensure_ready().await?;
        let records: Vec<Value> = self
            .store
            .get_by_index(SUBMITTED, INDEX_PROTOCOL, protocol)
            .await?;
        Ok(decode_records(records).into_iter().next())
    }

    /// Applies the server outcome: archives on acceptance, reports the reason
    /// on rejection. Returns the protocol.
    pub async fn complete_submission(
        &self,
        draft: &Draft,
        outcome: SubmissionOutcome,
    ) -> Result<String, DraftError> {
        match outcome {
            SubmissionOutcome::Accepted { protocol } => {
                self.save_submitted(draft, &protocol).await?;
                Ok(protocol)
            }
            SubmissionOutcome::Rejected { reason } => Err(DraftError::Rejected(reason)),
        }
    }
}

/// Converts a draft into its persisted shape.
pub(crate) fn encode_draft(draft: &Draft) -> DraftRecord {
    let fields = &draft.fields;
    DraftRecord {
        id: draft.id.0.clone(),
        complaint_type: fields.complaint_type,
        subject: fields.subject.clone(),
        channels: (!fields.channels.is_empty()).then(|| fields.channels.iter().copied().collect()),
        content: (!content_is_absent(&fields.content)).then(|| codec::encode_content(&fields.content)),
        created_at: draft.created_at,
        updated_at: draft.updated_at,
        status: draft.status,
        protocol: draft.protocol.clone(),
    }
}

pub(crate) fn decode_draft(record: DraftRecord) -> Result<Draft, CodecError> {
    let content = match &record.content {
        Some(stored) => codec::decode_content(stored)?,
        None => DraftContent::default(),
    };
    Ok(Draft {
        id: DraftId(record.id),
        fields: DraftFields {
            complaint_type: record.complaint_type,
            subject: record.subject,
            channels: record.channels.into_iter().flatten().collect(),
            content,
        },
        created_at: record.created_at,
        updated_at: record.updated_at,
        status: record.status,
        protocol: record.protocol,
    })
}

/// Decodes raw records one by one, skipping (and logging) any whose shape or
/// payload is unreadable.
fn decode_records(records: Vec<Value>) -> Vec<Draft> {
    records
        .into_iter()
        .filter_map(|value| {
            let id = value
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or("<no id>")
                .to_string();
            let decoded = serde_json::from_value::<DraftRecord>(value)
                .map_err(|e| e.to_string())
                .and_then(|record| decode_draft(record).map_err(|e| e.to_string()));
            match decoded {
                Ok(draft) => Some(draft),
                Err(e) => {
                    log::warn!("Skipping undecodable record {}: {}", id, e);
                    None
                }
            }
        })
        .collect()
}

fn content_is_absent(content: &DraftContent) -> bool {
    content.text.is_none() && content.audio.is_none() && content.files.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::draft::{Blob, Channel, ComplaintType, DraftField, FileAttachment};
    use crate::data::migration::{MemoryLegacyStore, KEY_TEXT, KEY_TYPE};
    use crate::storage::{Faults, MemoryStore};
    use futures_executor::block_on;
    use std::collections::BTreeSet;

    fn draft_with_text(text: &str) -> Draft {
        let mut fields = DraftFields::default();
        fields.apply(DraftField::Type(Some(ComplaintType::Reclamacao)));
        fields.apply(DraftField::Text(Some(text.to_string())));
        Draft::new(DraftId::generate(), fields)
    }

    #[test]
    fn test_save_twice_overwrites() {
        let store = MemoryStore::default();
        let repo = DraftRepository::new(store.clone());
        let mut draft = draft_with_text("primeira versão");

        block_on(async {
            let id = repo.save_draft(&draft).await.unwrap();
            assert_eq!(id, draft.id);

            draft.fields.apply(DraftField::Text(Some("segunda versão".to_string())));
            repo.save_draft(&draft).await.unwrap();

            let drafts = repo.get_drafts().await.unwrap();
            assert_eq!(drafts.len(), 1);
            assert_eq!(
                drafts[0].fields.content.text.as_deref(),
                Some("segunda versão")
            );
            assert!(drafts[0].created_at <= drafts[0].updated_at);
        });
        assert_eq!(store.len(DRAFTS), 1);
    }

    #[test]
    fn test_binaries_round_trip_through_repository() {
        let repo = DraftRepository::new(MemoryStore::default());
        let mut draft = draft_with_text("com anexos");
        draft.fields.apply(DraftField::Channels(BTreeSet::from([
            Channel::Text,
            Channel::Audio,
            Channel::Files,
        ])));
        draft.fields.apply(DraftField::Audio(Some(Blob::new(vec![9; 320], "audio/webm"))));
        draft.fields.apply(DraftField::Files(vec![FileAttachment::new(
            "laudo.pdf",
            1_700_000_000_000,
            Blob::new(b"%PDF-1.7".to_vec(), "application/pdf"),
        )]));

        let loaded = block_on(async {
            repo.save_draft(&draft).await.unwrap();
            repo.get_draft(&draft.id).await.unwrap().unwrap()
        });
        assert_eq!(loaded.fields, draft.fields);
        assert_eq!(
            loaded.created_at.timestamp_millis(),
            draft.created_at.timestamp_millis()
        );
        assert_eq!(loaded.status, DraftStatus::Draft);
    }

    #[test]
    fn test_empty_draft_is_refused() {
        let store = MemoryStore::default();
        let repo = DraftRepository::new(store.clone());
        let draft = Draft::new(DraftId::generate(), DraftFields::default());
        assert_eq!(block_on(repo.save_draft(&draft)), Err(DraftError::EmptyDraft));
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn test_delete_and_missing_draft() {
        let repo = DraftRepository::new(MemoryStore::default());
        let draft = draft_with_text("x");
        block_on(async {
            repo.save_draft(&draft).await.unwrap();
            repo.delete_draft(&draft.id).await.unwrap();
            repo.delete_draft(&draft.id).await.unwrap();
            assert_eq!(repo.get_draft(&draft.id).await.unwrap(), None);
        });
    }

    #[test]
    fn test_submission_moves_draft() {
        let repo = DraftRepository::new(MemoryStore::default());
        let draft = draft_with_text("Buraco na rua X");

        block_on(async {
            repo.save_draft(&draft).await.unwrap();
            repo.save_submitted(&draft, "OUV-2025-123").await.unwrap();

            assert_eq!(repo.get_draft(&draft.id).await.unwrap(), None);
            let submitted = repo.get_submitted().await.unwrap();
            assert_eq!(submitted.len(), 1);
            assert_eq!(submitted[0].status, DraftStatus::Submitted);
            assert_eq!(submitted[0].protocol.as_deref(), Some("OUV-2025-123"));
            assert_eq!(
                submitted[0].created_at.timestamp_millis(),
                draft.created_at.timestamp_millis()
            );

            let found = repo.find_submitted("OUV-2025-123").await.unwrap().unwrap();
            assert_eq!(found.id, draft.id);
            assert_eq!(repo.find_submitted("OUV-0").await.unwrap(), None);
        });
    }

    #[test]
    fn test_failed_delete_keeps_submitted_copy() {
        let store = MemoryStore::default();
        let repo = DraftRepository::new(store.clone());
        let draft = draft_with_text("x");

        block_on(async {
            repo.save_draft(&draft).await.unwrap();
            store.set_faults(Faults {
                delete: Some(StorageError::TransactionFailed("aborted".to_string())),
                ..Faults::default()
            });
            repo.save_submitted(&draft, "OUV-9").await.unwrap();
        });
        assert_eq!(store.len(SUBMITTED), 1);
        assert_eq!(store.len(DRAFTS), 1);
    }

    #[test]
    fn test_failed_submitted_write_keeps_draft() {
        let store = MemoryStore::default();
        let repo = DraftRepository::new(store.clone());
        let draft = draft_with_text("x");

        let result = block_on(async {
            repo.save_draft(&draft).await.unwrap();
            store.set_faults(Faults {
                put: Some(StorageError::QuotaExceeded),
                ..Faults::default()
            });
            repo.save_submitted(&draft, "OUV-10").await
        });
        assert_eq!(result, Err(DraftError::Storage(StorageError::QuotaExceeded)));
        assert_eq!(store.len(SUBMITTED), 0);
        assert_eq!(store.len(DRAFTS), 1);
    }

    #[test]
    fn test_complete_submission_outcomes() {
        let repo = DraftRepository::new(MemoryStore::default());
        let draft = draft_with_text("x");
        block_on(async {
            repo.save_draft(&draft).await.unwrap();

            let rejected = repo
                .complete_submission(
                    &draft,
                    SubmissionOutcome::Rejected {
                        reason: "captcha".to_string(),
                    },
                )
                .await;
            assert_eq!(rejected, Err(DraftError::Rejected("captcha".to_string())));
            assert!(repo.get_draft(&draft.id).await.unwrap().is_some());

            assert_eq!(
                repo.save_submitted(&draft, "  ").await,
                Err(DraftError::MissingProtocol)
            );

            let protocol = repo
                .complete_submission(
                    &draft,
                    SubmissionOutcome::Accepted {
                        protocol: "OUV-2025-1".to_string(),
                    },
                )
                .await
                .unwrap();
            assert_eq!(protocol, "OUV-2025-1");
            assert!(repo.get_drafts().await.unwrap().is_empty());
        });
    }

    #[test]
    fn test_drafts_listed_newest_first_and_cleared() {
        let repo = DraftRepository::new(MemoryStore::default());
        block_on(async {
            let older = draft_with_text("a");
            let newer = draft_with_text("b");
            repo.save_draft(&older).await.unwrap();
            repo.save_draft(&newer).await.unwrap();

            let listed = repo.get_drafts().await.unwrap();
            assert_eq!(listed.len(), 2);
            assert!(listed[0].updated_at >= listed[1].updated_at);

            repo.clear_drafts().await.unwrap();
            assert!(repo.get_drafts().await.unwrap().is_empty());
        });
    }

    #[test]
    fn test_undecodable_record_is_skipped() {
        let store = MemoryStore::default();
        let repo = DraftRepository::new(store.clone());
        block_on(async {
            repo.save_draft(&draft_with_text("ok")).await.unwrap();
            let mut broken = encode_draft(&draft_with_text("broken"));
            broken.content = Some(crate::data::draft::StoredContent {
                audio_base64: Some("%%%".to_string()),
                ..Default::default()
            });
            store.put(DRAFTS, &broken).await.unwrap();

            let drafts = repo.get_drafts().await.unwrap();
            assert_eq!(drafts.len(), 1);
            assert!(repo.get_draft(&DraftId(broken.id.clone())).await.is_err());
        });
    }

    #[test]
    fn test_malformed_record_does_not_hide_the_others() {
        let store = MemoryStore::default();
        let repo = DraftRepository::new(store.clone());
        let valid = draft_with_text("continua valendo");
        block_on(async {
            repo.save_draft(&valid).await.unwrap();
            store
                .put(
                    DRAFTS,
                    &serde_json::json!({
                        "id": "draft_legacy",
                        "type": "informacao",
                        "createdAt": "2024-03-01T10:00:00.000Z",
                        "updatedAt": "2024-03-01T10:00:00.000Z",
                        "status": "draft",
                    }),
                )
                .await
                .unwrap();
            store
                .put(DRAFTS, &serde_json::json!({ "id": "draft_no_dates" }))
                .await
                .unwrap();

            let drafts = repo.get_drafts().await.unwrap();
            assert_eq!(drafts.len(), 1);
            assert_eq!(drafts[0].id, valid.id);

            repo.save_submitted(&valid, "OUV-7").await.unwrap();
            store
                .put(
                    SUBMITTED,
                    &serde_json::json!({
                        "id": "draft_old",
                        "type": "reclamacao",
                        "createdAt": "ontem",
                        "updatedAt": "ontem",
                        "status": "submitted",
                        "protocol": "OUV-8",
                    }),
                )
                .await
                .unwrap();
            let submitted = repo.get_submitted().await.unwrap();
            assert_eq!(submitted.len(), 1);
            assert_eq!(submitted[0].protocol.as_deref(), Some("OUV-7"));
            assert_eq!(repo.find_submitted("OUV-8").await.unwrap(), None);
        });
    }

    #[test]
    fn test_empty_draft_is_never_archived() {
        let store = MemoryStore::default();
        let repo = DraftRepository::new(store.clone());
        let draft = Draft::new(DraftId::generate(), DraftFields::default());
        assert_eq!(
            block_on(repo.save_submitted(&draft, "OUV-1")),
            Err(DraftError::EmptyDraft)
        );
        assert_eq!(store.len(SUBMITTED), 0);
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn test_legacy_migration_runs_before_first_read() {
        let legacy = MemoryLegacyStore::with_items([
            (KEY_TYPE, "sugestao"),
            (KEY_TEXT, "Mais ciclovias"),
        ]);
        let store = MemoryStore::default();
        let repo = DraftRepository::new(store.clone()).with_legacy(Rc::new(legacy.clone()));

        block_on(async {
            let drafts = repo.get_drafts().await.unwrap();
            assert_eq!(drafts.len(), 1);
            assert_eq!(
                drafts[0].fields.complaint_type,
                Some(ComplaintType::Sugestao)
            );

            // A second repository over the same stores finds the flag set.
            let again = DraftRepository::new(store.clone()).with_legacy(Rc::new(legacy.clone()));
            let report = again.migrate().await.unwrap().unwrap();
            assert_eq!(report.migrated_drafts, 0);
            assert_eq!(again.get_drafts().await.unwrap().len(), 1);
        });
    }

    #[test]
    fn test_unavailable_storage_is_distinguishable() {
        let repo = DraftRepository::new(MemoryStore::unavailable());
        let err = block_on(repo.get_drafts()).unwrap_err();
        assert!(err.is_unavailable());
    }
}
