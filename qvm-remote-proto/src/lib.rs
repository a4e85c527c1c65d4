//! Shared protocol, crypto auth, and audit primitives for `qvm-remote`.
//!
//! This crate has no knowledge of the filesystem queue layout or of how a
//! command is actually executed — it only knows `cid`s, keys, result
//! metadata, and how to write an audit line. The submitter and executor
//! binaries build the pull-model protocol on top of these.

pub mod audit;
pub mod auth;
pub mod cid;
pub mod config;
pub mod error;
pub mod keystore;
pub mod meta;
pub mod time;

pub use audit::{AuditEvent, AuditLog};
pub use auth::Key;
pub use cid::Cid;
pub use config::Config;
pub use error::{Error, Result};
pub use keystore::KeyStore;
pub use meta::{ResultMeta, EXIT_EXEC_ERROR, EXIT_TIMEOUT};
