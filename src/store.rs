// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provides local persistence of signed role documents, keyed by role name.

use crate::error::{self, Result};
use crate::io::read_capped;
use log::debug;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use snafu::ResultExt;
use std::fmt::Debug;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Characters that must not pass through into a file name. Role names are
/// opaque keys in the store, never filesystem paths.
const CHARACTERS_TO_AVOID: &AsciiSet = &CONTROLS
    .add(b'/')
    .add(b'\\')
    .add(b'.')
    .add(b':')
    .add(b'*')
    .add(b'?')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'|')
    .add(b'%');

/// Encodes a role name so it is safe to use as a file name.
pub(crate) fn encode_filename(name: &str) -> String {
    utf8_percent_encode(name, CHARACTERS_TO_AVOID).to_string()
}

/// Local persistence of signed role documents keyed by role name.
pub trait MetadataStore: Debug {
    /// Returns the stored bytes for a role, reading at most `max_size`.
    /// Missing metadata is reported as [`crate::error::Error::MetaNotFound`].
    fn get_meta(&self, role: &str, max_size: u64) -> Result<Vec<u8>>;

    /// Stores the bytes for a role.
    fn set_meta(&self, role: &str, bytes: &[u8]) -> Result<()>;
}

impl<T: MetadataStore + ?Sized> MetadataStore for Arc<T> {
    fn get_meta(&self, role: &str, max_size: u64) -> Result<Vec<u8>> {
        (**self).get_meta(role, max_size)
    }

    fn set_meta(&self, role: &str, bytes: &[u8]) -> Result<()> {
        (**self).set_meta(role, bytes)
    }
}

/// A `MetadataStore` over `<baseDir>/tuf/<gun>/metadata/`, one
/// `<role>.json` file per role. Writes are atomic
/// (write-temp-then-rename).
#[derive(Debug, Clone)]
pub struct FilesystemStore {
    dir: PathBuf,
}

impl FilesystemStore {
    /// Creates a store rooted at the given metadata directory.
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn meta_path(&self, role: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_filename(role)))
    }
}

impl MetadataStore for FilesystemStore {
    fn get_meta(&self, role: &str, max_size: u64) -> Result<Vec<u8>> {
        let path = self.meta_path(role);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return error::MetaNotFoundSnafu { role }.fail();
            }
            Err(err) => return Err(err).context(error::FileOpenSnafu { path }),
        };
        read_capped(file, max_size, "metadata store limit")
    }

    fn set_meta(&self, role: &str, bytes: &[u8]) -> Result<()> {
        std::fs::create_dir_all(&self.dir).context(error::DirCreateSnafu { path: &self.dir })?;
        let path = self.meta_path(role);
        write_atomic(&path, bytes)?;
        debug!("wrote {} byte(s) of {} metadata", bytes.len(), role);
        Ok(())
    }
}

/// Writes `bytes` to `path` atomically: write to a temporary file in the same
/// directory, fsync, then rename over the destination.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp =
        tempfile::NamedTempFile::new_in(dir).context(error::FileTempCreateSnafu { path: dir })?;
    std::io::Write::write_all(&mut tmp, bytes).context(error::FileWriteSnafu { path })?;
    tmp.as_file()
        .sync_all()
        .context(error::FileWriteSnafu { path })?;
    tmp.persist(path).context(error::FilePersistSnafu { path })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(tmp.path().join("metadata"));
        store.set_meta("root", b"{\"signed\":{}}").unwrap();
        assert_eq!(store.get_meta("root", 1024).unwrap(), b"{\"signed\":{}}");
    }

    #[test]
    fn missing_role_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(tmp.path());
        assert!(matches!(
            store.get_meta("root", 1024),
            Err(crate::error::Error::MetaNotFound { .. })
        ));
    }

    #[test]
    fn oversized_meta_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(tmp.path());
        store.set_meta("targets", &[b'x'; 100]).unwrap();
        assert!(matches!(
            store.get_meta("targets", 99),
            Err(crate::error::Error::MaxSizeExceeded { .. })
        ));
    }

    #[test]
    fn role_names_are_opaque_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(tmp.path().join("metadata"));
        // A hostile role name must not escape the metadata directory.
        store.set_meta("../escape", b"data").unwrap();
        assert!(!tmp.path().join("escape.json").exists());
        assert_eq!(store.get_meta("../escape", 1024).unwrap(), b"data");
        assert_eq!(encode_filename("../escape"), "%2E%2E%2Fescape");
    }
}
