//! Debounced, field-level autosave.
//!
//! UI code calls `update_field` on every edit. The controller merges the edit
//! into an in-memory accumulator, allocates the draft id on the first
//! meaningful edit and (re)arms a debounce timer. When the timer fires, the
//! cumulative state is written through the repository.
//!
//! ## Phases
//! ```text
//! Empty ──meaningful edit──▶ Dirty ──timer──▶ Persisting ──ok──▶ Clean
//!                              ▲                  │                 │
//!                              └──────edit────────┴───────edit──────┘
//! ```
//!
//! Every edit bumps a revision counter. A save records the revision it
//! captured, so a teardown `flush` writes only when there is a revision that is
//! neither saved nor already being written.

pub mod scheduler;
pub mod settings;

pub use scheduler::Scheduler;
#[cfg(target_arch = "wasm32")]
pub use scheduler::BrowserScheduler;
pub use settings::AutosaveSettings;

use crate::data::{
    Draft, DraftError, DraftField, DraftFields, DraftId, DraftRepository, SubmissionOutcome,
};
use crate::storage::RecordStore;
use chrono::{DateTime, Utc};
use futures_channel::oneshot;
use futures_util::future::{AbortHandle, Abortable};
use futures_util::FutureExt;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutosavePhase {
    /// Nothing worth persisting.
    Empty,
    /// Unsaved edits, save scheduled (or failed and awaiting the next edit).
    Dirty,
    Persisting,
    /// Persisted state matches the accumulator.
    Clean,
}

impl AutosavePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutosavePhase::Empty => "empty",
            AutosavePhase::Dirty => "dirty",
            AutosavePhase::Persisting => "persisting",
            AutosavePhase::Clean => "clean",
        }
    }
}

/// Observable controller state for the UI.
#[derive(Debug, Clone, PartialEq)]
pub struct AutosaveStatus {
    pub phase: AutosavePhase,
    pub draft_id: Option<DraftId>,
    pub last_error: Option<DraftError>,
    pub last_saved_at: Option<DateTime<Utc>>,
}

struct Session {
    fields: DraftFields,
    draft_id: Option<DraftId>,
    created_at: Option<DateTime<Utc>>,
    revision: u64,
    saved_revision: u64,
    in_flight: Option<u64>,
    /// Bumped whenever the session is replaced, so late saves of a previous
    /// session leave the new one alone.
    generation: u64,
    phase: AutosavePhase,
    pending: Option<AbortHandle>,
    last_error: Option<DraftError>,
    last_saved_at: Option<DateTime<Utc>>,
}

impl Session {
    fn new(generation: u64) -> Self {
        Self {
            fields: DraftFields::default(),
            draft_id: None,
            created_at: None,
            revision: 0,
            saved_revision: 0,
            in_flight: None,
            generation,
            phase: AutosavePhase::Empty,
            pending: None,
            last_error: None,
            last_saved_at: None,
        }
    }

    fn cancel_pending(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }

    fn has_unsaved_revision(&self) -> bool {
        self.revision > self.saved_revision && self.in_flight != Some(self.revision)
    }

    /// Phase once no save is running: unsaved edits are dirty only while they
    /// are still worth persisting.
    fn idle_phase(&self) -> AutosavePhase {
        if self.fields.is_meaningful() {
            AutosavePhase::Dirty
        } else {
            AutosavePhase::Empty
        }
    }

    /// Replaces the session, cancelling its timer.
    fn replace(&mut self, next: Session) {
        self.cancel_pending();
        *self = next;
    }
}

struct Inner<S, R> {
    repository: DraftRepository<S>,
    scheduler: R,
    settings: AutosaveSettings,
    session: RefCell<Session>,
    /// Draft writes currently awaiting the store, across sessions.
    running: Cell<u32>,
    idle: RefCell<Vec<oneshot::Sender<()>>>,
}

/// Marks one draft write as running until dropped.
struct RunningSave<'a, S, R>(&'a Inner<S, R>);

impl<S, R> Drop for RunningSave<'_, S, R> {
    fn drop(&mut self) {
        let running = self.0.running.get().saturating_sub(1);
        self.0.running.set(running);
        if running == 0 {
            for waiter in self.0.idle.borrow_mut().drain(..) {
                let _ = waiter.send(());
            }
        }
    }
}

impl<S: RecordStore + Clone + 'static, R: Scheduler + 'static> Inner<S, R> {
    /// Resolves once no draft write is running.
    async fn wait_idle(&self) {
        if self.running.get() == 0 {
            return;
        }
        let (tx, rx) = oneshot::channel();
        self.idle.borrow_mut().push(tx);
        let _ = rx.await;
    }

    /// Writes the accumulator if it holds an unsaved, meaningful revision.
    ///
    /// Returns `Ok(false)` when there was nothing to write.
    async fn persist(&self) -> Result<bool, DraftError> {
        let (draft, revision, generation) = {
            let mut session = self.session.borrow_mut();
            if !session.fields.is_meaningful() || !session.has_unsaved_revision() {
                return Ok(false);
            }
            let id = session
                .draft_id
                .get_or_insert_with(DraftId::generate)
                .clone();
            let created_at = *session.created_at.get_or_insert_with(Utc::now);

            let mut draft = Draft::new(id, session.fields.clone());
            draft.created_at = created_at;
            draft.touch(Utc::now());

            session.in_flight = Some(session.revision);
            session.phase = AutosavePhase::Persisting;
            (draft, session.revision, session.generation)
        };

        log::debug!("Autosaving {} at revision {}", draft.id, revision);
        self.running.set(self.running.get() + 1);
        let running = RunningSave(self);
        let result = self.repository.save_draft(&draft).await;
        drop(running);

        let mut session = self.session.borrow_mut();
        if session.generation != generation {
            return result.map(|_| true);
        }
        if session.in_flight == Some(revision) {
            session.in_flight = None;
        }
        match result {
            Ok(_) => {
                session.saved_revision = session.saved_revision.max(revision);
                session.last_saved_at = Some(Utc::now());
                session.last_error = None;
                if session.revision == revision {
                    session.phase = AutosavePhase::Clean;
                } else if session.in_flight.is_none() {
                    session.phase = session.idle_phase();
                }
                Ok(true)
            }
            Err(e) => {
                log::warn!("Autosave of {} failed: {}", draft.id, e);
                session.last_error = Some(e.clone());
                if session.in_flight.is_none() {
                    session.phase = session.idle_phase();
                }
                Err(e)
            }
        }
    }
}

/// Field-level autosave over a draft repository.
///
/// Clones share the same session.
pub struct AutosaveController<S, R> {
    inner: Rc<Inner<S, R>>,
}

impl<S, R> Clone for AutosaveController<S, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: RecordStore + Clone + 'static, R: Scheduler + 'static> AutosaveController<S, R> {
    pub fn new(repository: DraftRepository<S>, scheduler: R, settings: AutosaveSettings) -> Self {
        Self {
            inner: Rc::new(Inner {
                repository,
                scheduler,
                settings,
                session: RefCell::new(Session::new(0)),
                running: Cell::new(0),
                idle: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn repository(&self) -> &DraftRepository<S> {
        &self.inner.repository
    }

    /// Merges one field edit and re-arms the debounce timer.
    ///
    /// Synchronous: the draft id is allocated before this returns, so rapid
    /// edits never race to allocate two ids.
    pub fn update_field(&self, field: DraftField) {
        let mut session = self.inner.session.borrow_mut();
        log::trace!("Field update: {}", field.path());
        session.fields.apply(field);
        session.revision += 1;
        session.cancel_pending();

        if !session.fields.is_meaningful() {
            session.phase = AutosavePhase::Empty;
            return;
        }

        if session.draft_id.is_none() {
            session.draft_id = Some(DraftId::generate());
        }
        session.phase = AutosavePhase::Dirty;
        session.pending = Some(self.schedule_save());
    }

    fn schedule_save(&self) -> AbortHandle {
        let (handle, registration) = AbortHandle::new_pair();
        let sleep = Abortable::new(
            self.inner.scheduler.sleep(self.inner.settings.debounce()),
            registration,
        );
        let inner: Weak<Inner<S, R>> = Rc::downgrade(&self.inner);

        let task = async move {
            if sleep.await.is_err() {
                return;
            }
            if let Some(inner) = inner.upgrade() {
                // Failures are recorded on the session.
                let _ = inner.persist().await;
            }
        };
        self.inner.scheduler.spawn(task.boxed_local());
        handle
    }

    /// Cancels the pending timer and persists immediately.
    ///
    /// Writes nothing when the accumulator is empty, already saved, or its
    /// latest revision is being written by an in-flight save.
    pub async fn flush(&self) -> Result<(), DraftError> {
        self.inner.session.borrow_mut().cancel_pending();
        self.inner.persist().await.map(|_| ())
    }

    /// Resets to an empty session. No pending save fires.
    pub fn clear(&self) {
        let mut session = self.inner.session.borrow_mut();
        let generation = session.generation + 1;
        session.replace(Session::new(generation));
    }

    /// Takes over an existing draft: later edits overwrite the same record.
    pub fn adopt(&self, draft: &Draft) {
        let mut session = self.inner.session.borrow_mut();
        let mut next = Session::new(session.generation + 1);
        next.fields = draft.fields.clone();
        next.draft_id = Some(draft.id.clone());
        next.created_at = Some(draft.created_at);
        next.phase = AutosavePhase::Clean;
        next.last_saved_at = Some(draft.updated_at);
        session.replace(next);
    }

    /// Flushes the current session, then loads and adopts a stored draft.
    ///
    /// Returns `Ok(None)` (keeping the current session) if no such draft exists.
    pub async fn load_draft(&self, id: &DraftId) -> Result<Option<Draft>, DraftError> {
        if let Err(e) = self.flush().await {
            log::warn!("Could not flush edits before loading {}: {}", id, e);
        }
        let Some(draft) = self.inner.repository.get_draft(id).await? else {
            return Ok(None);
        };
        self.adopt(&draft);
        log::info!("Continuing draft {}", draft.id);
        Ok(Some(draft))
    }

    /// Applies the server outcome to the current session.
    ///
    /// On acceptance the draft is archived under its protocol and the session
    /// resets. On rejection the edits are flushed and kept. An empty session
    /// is never archived.
    pub async fn submit(&self, outcome: SubmissionOutcome) -> Result<String, DraftError> {
        let protocol = match outcome {
            SubmissionOutcome::Accepted { protocol } => protocol,
            SubmissionOutcome::Rejected { reason } => {
                if let Err(e) = self.flush().await {
                    log::warn!("Could not flush rejected submission: {}", e);
                }
                return Err(DraftError::Rejected(reason));
            }
        };

        {
            let mut session = self.inner.session.borrow_mut();
            if !session.fields.is_meaningful() {
                return Err(DraftError::EmptyDraft);
            }
            session.cancel_pending();
        }
        // A debounced write still landing after the archive would resurrect
        // the draft.
        self.inner.wait_idle().await;

        let draft = {
            let mut session = self.inner.session.borrow_mut();
            if !session.fields.is_meaningful() {
                return Err(DraftError::EmptyDraft);
            }
            let id = session
                .draft_id
                .get_or_insert_with(DraftId::generate)
                .clone();
            let created_at = *session.created_at.get_or_insert_with(Utc::now);
            let mut draft = Draft::new(id, session.fields.clone());
            draft.created_at = created_at;
            draft
        };

        match self.inner.repository.save_submitted(&draft, &protocol).await {
            Ok(()) => {
                self.clear();
                Ok(protocol)
            }
            Err(e) => {
                let mut session = self.inner.session.borrow_mut();
                session.last_error = Some(e.clone());
                if session.fields.is_meaningful() && session.has_unsaved_revision() {
                    drop(session);
                    let handle = self.schedule_save();
                    self.inner.session.borrow_mut().pending = Some(handle);
                }
                Err(e)
            }
        }
    }

    pub fn status(&self) -> AutosaveStatus {
        let session = self.inner.session.borrow();
        AutosaveStatus {
            phase: session.phase,
            draft_id: session.draft_id.clone(),
            last_error: session.last_error.clone(),
            last_saved_at: session.last_saved_at,
        }
    }

    /// Snapshot of the accumulator.
    pub fn fields(&self) -> DraftFields {
        self.inner.session.borrow().fields.clone()
    }
}
