//! Draft data model and persistence.
//!
//! ## Layers
//! - `draft`: domain types and the persisted record shape
//! - `codec`: base64 encoding of audio and file payloads
//! - `repository`: typed CRUD over the `drafts` and `submitted` collections
//! - `migration`: one-time import of the legacy flat `localStorage` form
//!
//! ### Record Layout
//! ```text
//! { id, type, subject?, channels?, content?: { text?, audioBase64?, audioType?,
//!   files?: [{ name, type, size, base64, lastModified }] },
//!   createdAt, updatedAt, status, protocol? }
//! ```

pub mod codec;
pub mod draft;
pub mod migration;
pub mod repository;

#[cfg(target_arch = "wasm32")]
pub mod web;

pub use codec::CodecError;
pub use draft::*;
#[cfg(target_arch = "wasm32")]
pub use migration::LocalStorageStore;
pub use migration::{
    LegacyMigration, LegacyStore, MemoryLegacyStore, MigrationReport, MigrationState,
};
pub use repository::{DraftError, DraftRepository, SubmissionOutcome};
