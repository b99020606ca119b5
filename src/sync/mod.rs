// src/sync/mod.rs

//! Client side repository synchronization
//!
//! [`Updater`] drives the per-repository state machine. The differential
//! (EAPI3) exchange lives in [`DeltaSync`] and talks to a
//! [`RepositoryService`]. Transfers are cancelled through [`CancelToken`]s
//! fed by a [`LockPoller`].

mod cancel;
mod delta;
mod service;
mod updater;

pub use cancel::{CancelToken, LockPoller};
pub use delta::{DeltaOutcome, DeltaSync};
pub use service::{
    DeltaSet, HttpServiceClient, MockService, RepositoryMetadata, RepositoryService,
    ServiceHandler, ServiceReply, ServiceRequest,
};
pub use updater::{SyncOutcome, SyncSummary, Updater};
