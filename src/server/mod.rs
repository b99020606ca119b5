// src/server/mod.rs
//! Repository publishing side
//!
//! This module keeps the mirrors of a repository in step with the server:
//! - Probes each mirror for its revision and lock markers
//! - Computes which mirrors need a download or an upload
//! - Builds the per-EAPI upload artifacts, optionally signed
//! - Gates uploads behind QA checks
//!
//! The EAPI3 differential service handler lives in [`crate::sync`] next to
//! its client and is re-exported here.

mod mirror_sync;
mod packager;
pub mod qa;
mod queue;
mod status;

pub use crate::sync::ServiceHandler;
pub use mirror_sync::{MirrorSync, MirrorSyncResult};
pub use packager::{UploadBundle, UploadPackager, public_key_name};
pub use qa::{QaCategory, QaCheck, QaIssue, QaSeverity, QaVerdict};
pub use queue::{SyncQueue, calculate_queue};
pub use status::{MirrorStatus, probe_mirror};
