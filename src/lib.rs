// src/lib.rs

//! Package repository synchronization engine
//!
//! Keeps a versioned, checksummed package database in sync between an
//! authoring server, its download mirrors and client machines.
//!
//! # Architecture
//!
//! - Clients: [`sync::Updater`] fetches, verifies and atomically commits
//!   remote snapshots, negotiating the protocol generation ([`eapi::Eapi`])
//!   per repository and falling back from differential to full downloads
//! - Servers: [`server::MirrorSync`] decides which mirrors are stale,
//!   builds upload artifacts and pushes them under mirror locks
//! - Mirrors are reached through [`transport::MirrorTransport`]
//! - On-disk changes only ever land through [`commit::atomic_replace`]

pub mod commit;
pub mod compression;
pub mod config;
pub mod eapi;
mod error;
pub mod gpg;
pub mod hash;
pub mod hooks;
pub mod lock;
pub mod repository;
pub mod server;
pub mod sync;
pub mod transport;

pub use config::{EnvOverrides, Settings, SyncContext};
pub use eapi::{Eapi, EapiNegotiator};
pub use error::{Error, Result};
pub use hash::{ChecksumRecord, HashAlgorithm, Hasher, VerifyStatus};
pub use repository::{PackageDatabase, Repository};
pub use sync::{SyncOutcome, SyncSummary, Updater};
