//! # Error Handling
//!
//! A single crate-wide error enum covers every failure mode, with a `Result`
//! alias used throughout. Worker loops never let errors escape the process:
//! each handler catches them at the pool boundary and translates them into a
//! client-visible `NOTICE` or `OK` frame.
//!
//! Two variants deserve a note:
//!
//! - [`Error::Proto`] carries the human-readable reason that ends up inside
//!   `NOTICE` / `OK` replies (bad frames, bad filters, failed AUTH). The
//!   message text is part of the wire contract, so it is written for clients,
//!   not for logs.
//! - [`Error::Sqlite`] wraps storage failures. A failed open is fatal for the
//!   request that triggered it, never for the process; the next request for
//!   the same tenant retries the open.

use thiserror::Error;

/// All errors that can occur inside the relay core.
#[derive(Error, Debug)]
pub enum Error {
    /// Protocol-level rejection with a client-facing message.
    #[error("{0}")]
    Proto(String),

    /// SQLite operation failed (open, read, or commit).
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON parse or serialize failure.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// Signature verification failure from the secp256k1 backend.
    #[error("signature: {0}")]
    Secp(#[from] secp256k1::Error),

    /// Set-reconciliation protocol failure.
    #[error("negentropy: {0}")]
    Negentropy(#[from] negentropy::Error),

    /// Filesystem failure (tenant directory creation, watcher setup).
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// File-change watcher could not be installed.
    #[error("watcher: {0}")]
    Watch(#[from] notify::Error),
}

impl Error {
    /// Shorthand for a protocol rejection carrying a client-facing message.
    pub fn proto(msg: impl Into<String>) -> Self {
        Error::Proto(msg.into())
    }
}

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
