// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Signet is the client core of a content-trust system built on [TUF].
//!
//! For a named collection (a GUN, Globally Unique Name), a [`Collection`]
//! maintains a locally signed set of TUF metadata (root, targets, snapshot)
//! and a journal of pending mutations, and synchronizes with a remote notary
//! server that holds the authoritative copies plus a server-managed
//! timestamp role.
//!
//! Trust is bootstrapped from an on-disk trust store: a downloaded root is
//! accepted only if its keys resolve to pinned leaf certificates (with a
//! common name matching the GUN) or chain to CA anchors. Private keys live
//! encrypted in key custody and are decrypted only for the duration of one
//! signing call.
//!
//! Delegated roles beyond the top four (root, targets, snapshot, timestamp)
//! are not supported.
//!
//! [TUF]: https://theupdateframework.github.io/
//!
//! # Testing
//!
//! Unit tests are run in the usual manner: `cargo test`. The integration
//! tests under `tests/` drive a collection against an in-memory notary
//! double; no network access is required.

#![forbid(missing_debug_implementations, missing_copy_implementations)]
#![deny(rust_2018_idioms)]
// missing_docs is on its own line to make it easy to comment out when making changes.
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc
)]

mod bootstrap;
pub mod changelist;
mod collection;
pub mod custody;
pub mod engine;
pub mod error;
mod io;
pub mod remote;
pub mod schema;
pub mod sign;
pub mod store;
pub mod trust;

pub use crate::collection::Collection;
pub use crate::custody::{KeyCustody, PassphraseSource, Signer, StaticPassphrase};
pub use crate::error::{Error, Result};
pub use crate::remote::RemoteStore;
pub use crate::store::MetadataStore;
pub use crate::trust::TrustStore;

use std::path::PathBuf;

/// Limits used when fetching metadata.
///
/// These limits are implemented to prevent endless data attacks. The root
/// limit also guards the bootstrap path, where nothing else bounds the
/// download.
///
/// The [`Default`] implementation sets the following values:
/// * `max_root_size`: 5 MiB
/// * `max_targets_size`: 10 MiB
/// * `max_snapshot_size`: 10 MiB
/// * `max_timestamp_size`: 1 MiB
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// The maximum allowable size in bytes for downloaded root metadata.
    pub max_root_size: u64,

    /// The maximum allowable size in bytes for downloaded targets metadata
    /// **if** the size is not listed in snapshot metadata.
    pub max_targets_size: u64,

    /// The maximum allowable size in bytes for downloaded snapshot metadata
    /// **if** the size is not listed in timestamp metadata.
    pub max_snapshot_size: u64,

    /// The maximum allowable size in bytes for downloaded timestamp
    /// metadata.
    pub max_timestamp_size: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_root_size: 1024 * 1024 * 5,     // 5 MiB
            max_targets_size: 1024 * 1024 * 10, // 10 MiB
            max_snapshot_size: 1024 * 1024 * 10, // 10 MiB
            max_timestamp_size: 1024 * 1024,    // 1 MiB
        }
    }
}

/// Settings for one collection.
#[derive(Debug, Clone)]
pub struct CollectionSettings {
    /// The collection's Globally Unique Name, e.g. a repository name. It
    /// must match the common name of the trusted root certificate.
    pub gun: String,

    /// The base directory holding `trusted_certificates/`, `private_keys/`,
    /// and `tuf/<gun>/`.
    pub base_dir: PathBuf,

    /// How close to expiry the root role may get before publish re-signs it.
    pub root_safety_window: chrono::Duration,

    /// Limits used when fetching metadata.
    pub limits: Limits,
}

impl CollectionSettings {
    /// Settings with the default safety window (one week) and limits.
    pub fn new<S, P>(gun: S, base_dir: P) -> Self
    where
        S: Into<String>,
        P: Into<PathBuf>,
    {
        Self {
            gun: gun.into(),
            base_dir: base_dir.into(),
            root_safety_window: chrono::Duration::weeks(1),
            limits: Limits::default(),
        }
    }
}
