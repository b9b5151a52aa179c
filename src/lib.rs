#![warn(clippy::all)]

//! Ouvidoria Drafts - local-first persistence for complaint drafts.
//!
//! A citizen filling in the complaint intake form never loses work: every
//! field edit is merged into an in-memory draft and written to the browser's
//! IndexedDB after a short quiet period. Drafts can be resumed later, and once
//! the server accepts a submission the draft is archived under its protocol.
//!
//! - `storage`: collection-oriented record store over IndexedDB
//! - `data`: draft model, binary codec, repository and legacy migration
//! - `autosave`: debounced field-level autosave controller

pub mod autosave;
pub mod data;
pub mod storage;

#[cfg(target_arch = "wasm32")]
mod bindings;

pub use autosave::{
    AutosaveController, AutosavePhase, AutosaveSettings, AutosaveStatus, Scheduler,
};
pub use data::{
    Draft, DraftError, DraftField, DraftFields, DraftId, DraftRepository, SubmissionOutcome,
};
pub use storage::{IndexedDbStore, MemoryStore, RecordStore, StorageConfig, StorageError};

#[cfg(target_arch = "wasm32")]
pub use bindings::{Autosave, DraftStore};
