// src/repository/mod.rs

//! Repository model and package database
//!
//! This module provides:
//! - Derived artifact names and local paths for a repository
//! - Revision marker I/O
//! - The SQLite package database every EAPI level transports

mod database;
mod model;

pub use database::{
    AlignStats, ContentEntry, PackageDatabase, PackageRecord, SCHEMA_VERSION, TreeUpdate,
};
pub use model::{
    FileNames, Repository, RepositoryFiles, parse_revision, read_revision, write_revision,
};
