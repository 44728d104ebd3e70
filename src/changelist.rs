// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provides the `Changelist`, an append-only ordered journal of pending role
//! mutations persisted under the collection's working directory. Changes are
//! journaled by `add_target`/`remove_target` and consumed by `publish`.

use crate::error::{self, Result};
use crate::schema::decoded::{Base64, Decoded};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_plain::{forward_display_to_serde, forward_from_str_to_serde};
use snafu::ResultExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

const CHANGE_EXT: &str = "change";

/// What a change does to its role.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    /// Add a new entry.
    Create,
    /// Replace an existing entry.
    Update,
    /// Remove an entry.
    Delete,
}

forward_display_to_serde!(ChangeAction);
forward_from_str_to_serde!(ChangeAction);

/// A single pending mutation against a role.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Change {
    /// What the change does.
    pub action: ChangeAction,
    /// The role the change applies to (e.g. "targets").
    pub scope: String,
    /// The kind of entry changed (e.g. "target").
    pub kind: String,
    /// The path-like name of the entry.
    pub path: String,
    /// Opaque serialized content, typically target metadata.
    pub content: Decoded<Base64>,
}

/// An ordered, persistent journal rooted at
/// `<tufRepoPath>/changelist/`. Each change is one JSON file named by a
/// zero-padded sequence number, so lexical order is insertion order.
#[derive(Debug)]
pub struct Changelist {
    dir: PathBuf,
    next_seq: u64,
    // Held open so `close` has something meaningful to release.
    dir_handle: Option<File>,
}

impl Changelist {
    /// Opens (creating if needed) the journal directory and scans it to find
    /// the next sequence number.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context(error::DirCreateSnafu { path: &dir })?;
        let next_seq = Self::entries(&dir)?
            .last()
            .map(|(seq, _)| seq + 1)
            .unwrap_or(0);
        let dir_handle = Some(File::open(&dir).context(error::FileOpenSnafu { path: &dir })?);
        Ok(Self {
            dir,
            next_seq,
            dir_handle,
        })
    }

    /// The sorted `(sequence, path)` list of journal entries on disk.
    fn entries(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir).context(error::FileOpenSnafu { path: dir })? {
            let entry = entry.context(error::FileOpenSnafu { path: dir })?;
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != CHANGE_EXT) {
                continue;
            }
            let seq = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u64>().ok())
                .ok_or_else(|| {
                    error::ChangelistCorruptSnafu {
                        path: path.clone(),
                        reason: "file name is not a sequence number".to_string(),
                    }
                    .build()
                })?;
            entries.push((seq, path));
        }
        entries.sort_unstable_by_key(|(seq, _)| *seq);
        Ok(entries)
    }

    /// Appends a change; the entry and the directory are fsynced before this
    /// returns.
    pub fn add(&mut self, change: &Change) -> Result<()> {
        let path = self.dir.join(format!("{:020}.{}", self.next_seq, CHANGE_EXT));
        let data = serde_json::to_vec_pretty(change).context(error::EncodeSnafu {
            what: "change".to_string(),
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .context(error::FileTempCreateSnafu { path: &self.dir })?;
        std::io::Write::write_all(&mut tmp, &data).context(error::FileWriteSnafu { path: &path })?;
        tmp.as_file()
            .sync_all()
            .context(error::FileWriteSnafu { path: &path })?;
        tmp.persist(&path).context(error::FilePersistSnafu { path: &path })?;

        if let Some(dir_handle) = &self.dir_handle {
            dir_handle
                .sync_all()
                .context(error::FileWriteSnafu { path: &self.dir })?;
        }

        debug!("journaled {} {} '{}'", change.action, change.kind, change.path);
        self.next_seq += 1;
        Ok(())
    }

    /// Produces the journaled changes in insertion order. The iterator reads
    /// entries lazily and can be created again to restart.
    pub fn iter(&self) -> Result<ChangeIter> {
        Ok(ChangeIter {
            entries: Self::entries(&self.dir)?.into_iter(),
        })
    }

    /// Releases the held directory handle. Safe to call once per journal
    /// instance; operations after close still work but appends no longer
    /// fsync the directory.
    pub fn close(&mut self) {
        self.dir_handle.take();
    }

    /// Removes every journaled change. Only the publish pipeline calls this,
    /// after a successful remote upload.
    pub fn clear(&self) -> Result<()> {
        for (_, path) in Self::entries(&self.dir)? {
            fs::remove_file(&path).context(error::FileWriteSnafu { path: &path })?;
        }
        debug!("changelist cleared");
        Ok(())
    }

    /// True if no changes are journaled.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(Self::entries(&self.dir)?.is_empty())
    }
}

/// Lazy iterator over journaled changes; see [`Changelist::iter`].
#[derive(Debug)]
pub struct ChangeIter {
    entries: std::vec::IntoIter<(u64, PathBuf)>,
}

impl Iterator for ChangeIter {
    type Item = Result<Change>;

    fn next(&mut self) -> Option<Self::Item> {
        let (_, path) = self.entries.next()?;
        Some(read_change(&path))
    }
}

fn read_change(path: &Path) -> Result<Change> {
    let data = std::fs::read(path).context(error::FileReadSnafu { path })?;
    serde_json::from_slice(&data).map_err(|err| {
        error::ChangelistCorruptSnafu {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
        .build()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(path: &str) -> Change {
        Change {
            action: ChangeAction::Create,
            scope: "targets".to_string(),
            kind: "target".to_string(),
            path: path.to_string(),
            content: b"{}".to_vec().into(),
        }
    }

    #[test]
    fn insertion_order_preserved() {
        let tmp = tempfile::tempdir().unwrap();
        let mut list = Changelist::open(tmp.path().join("changelist")).unwrap();
        for name in ["a", "b", "c"] {
            list.add(&change(name)).unwrap();
        }

        let paths: Vec<String> = list
            .iter()
            .unwrap()
            .map(|c| c.unwrap().path)
            .collect();
        assert_eq!(paths, ["a", "b", "c"]);

        // Iteration is restartable.
        let again: Vec<String> = list.iter().unwrap().map(|c| c.unwrap().path).collect();
        assert_eq!(again, ["a", "b", "c"]);
    }

    #[test]
    fn order_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("changelist");
        {
            let mut list = Changelist::open(&dir).unwrap();
            list.add(&change("first")).unwrap();
        }
        let mut list = Changelist::open(&dir).unwrap();
        list.add(&change("second")).unwrap();

        let paths: Vec<String> = list.iter().unwrap().map(|c| c.unwrap().path).collect();
        assert_eq!(paths, ["first", "second"]);
    }

    #[test]
    fn clear_removes_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let mut list = Changelist::open(tmp.path()).unwrap();
        list.add(&change("a")).unwrap();
        assert!(!list.is_empty().unwrap());
        list.clear().unwrap();
        assert!(list.is_empty().unwrap());
        assert_eq!(list.iter().unwrap().count(), 0);
    }

    #[test]
    fn corrupt_entry_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let mut list = Changelist::open(tmp.path()).unwrap();
        list.add(&change("a")).unwrap();
        std::fs::write(tmp.path().join(format!("{:020}.change", 1)), b"not json").unwrap();

        let results: Vec<Result<Change>> = list.iter().unwrap().collect();
        assert!(results[0].is_ok());
        assert!(matches!(
            results[1],
            Err(crate::error::Error::ChangelistCorrupt { .. })
        ));
    }

    #[test]
    fn unordered_name_reported() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("garbage.change"), b"{}").unwrap();
        assert!(matches!(
            Changelist::open(tmp.path()),
            Err(crate::error::Error::ChangelistCorrupt { .. })
        ));
    }

    #[test]
    fn close_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let mut list = Changelist::open(tmp.path()).unwrap();
        list.close();
        list.close();
        list.add(&change("after close")).unwrap();
    }
}
