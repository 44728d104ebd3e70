// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0


use chrono::{Duration, Utc};
use signet::custody::StaticPassphrase;
use signet::error::Error;
use signet::schema::key::KeyAlgorithm;
use signet::schema::{Root, Signed, Snapshot, Target, Targets};
use signet::{Collection, CollectionSettings};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use test_utils::{MemoryNotary, TEST_PASSPHRASE};

const GUN: &str = "example.com/library/app";

fn open_collection(
    base: &Path,
    notary: &Arc<MemoryNotary>,
    passphrase: &str,
) -> Collection {
    Collection::open(
        CollectionSettings::new(GUN, base),
        Box::new(Arc::clone(notary)),
        Box::new(StaticPassphrase::new(passphrase)),
    )
    .expect("open collection")
}

fn initialized_collection(base: &Path, notary: &Arc<MemoryNotary>) -> Collection {
    let mut collection = open_collection(base, notary, TEST_PASSPHRASE);
    let signer = collection
        .create_root_key(KeyAlgorithm::Ecdsa)
        .expect("root key");
    collection.initialize(&signer).expect("initialize");
    collection
}

fn changelist_entries(base: &Path) -> usize {
    let dir = base.join("tuf").join(GUN).join("changelist");
    if !dir.is_dir() {
        return 0;
    }
    fs::read_dir(dir)
        .unwrap()
        .filter(|entry| {
            entry
                .as_ref()
                .unwrap()
                .path()
                .extension()
                .map_or(false, |ext| ext == "change")
        })
        .count()
}

/// Rewrites the locally stored root so it expires `hours` from now. Local
/// metadata is trusted without signature verification, which is exactly what
/// lets the near-expiry path notice and re-sign it.
fn age_local_root(base: &Path, hours: i64) {
    let path = base.join("tuf").join(GUN).join("metadata").join("root.json");
    let mut signed: Signed<Root> =
        serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    signed.signed.expires = Utc::now() + Duration::hours(hours);
    fs::write(&path, serde_json::to_vec(&signed).unwrap()).unwrap();
}

#[test]
fn first_publish_falls_back_and_uploads_in_order() {
    let tmp = tempfile::tempdir().unwrap();
    let notary = MemoryNotary::new();
    let mut collection = initialized_collection(tmp.path(), &notary);

    // Nothing on the remote yet; publish must fall back to local state.
    assert!(notary.meta("root").is_none());
    collection.publish().expect("publish");

    assert_eq!(notary.uploads(), ["root", "targets", "snapshot"]);

    // Both re-signed roles moved from version 1 to version 2.
    let targets: Signed<Targets> =
        serde_json::from_slice(&notary.meta("targets").unwrap()).unwrap();
    let snapshot: Signed<Snapshot> =
        serde_json::from_slice(&notary.meta("snapshot").unwrap()).unwrap();
    assert_eq!(targets.signed.version.get(), 2);
    assert_eq!(snapshot.signed.version.get(), 2);

    // Root was uploaded as-is.
    let root: Signed<Root> = serde_json::from_slice(&notary.meta("root").unwrap()).unwrap();
    assert_eq!(root.signed.version.get(), 1);

    assert_eq!(changelist_entries(tmp.path()), 0);
}

#[test]
fn add_publish_list_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let notary = MemoryNotary::new();
    let mut collection = initialized_collection(tmp.path(), &notary);

    let payload = tmp.path().join("app-v1.bin");
    fs::write(&payload, b"hello\n").unwrap();
    let target = Target::from_path(&payload).unwrap();
    collection.add_target("app/v1", &target).unwrap();
    assert_eq!(changelist_entries(tmp.path()), 1);

    collection.publish().expect("publish");
    assert_eq!(changelist_entries(tmp.path()), 0);

    let listed = collection.list_targets().expect("list targets");
    assert_eq!(listed.len(), 1);
    let (name, entry) = &listed[0];
    assert_eq!(name, "app/v1");
    assert_eq!(entry.length, 6);
    assert_eq!(
        entry.hashes.sha256.to_string(),
        "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"
    );

    let by_name = collection.get_target_by_name("app/v1").unwrap();
    assert_eq!(by_name.length, 6);
    assert!(matches!(
        collection.get_target_by_name("app/v2"),
        Err(Error::TargetNotFound { .. })
    ));
}

#[test]
fn publish_applies_deletes_too() {
    let tmp = tempfile::tempdir().unwrap();
    let notary = MemoryNotary::new();
    let mut collection = initialized_collection(tmp.path(), &notary);

    let payload = tmp.path().join("data.bin");
    fs::write(&payload, b"123\n456\n789\n0\n").unwrap();
    collection
        .add_target("app/v1", &Target::from_path(&payload).unwrap())
        .unwrap();
    collection.publish().expect("first publish");

    collection.remove_target("app/v1").unwrap();
    collection.publish().expect("second publish");

    assert!(collection.list_targets().unwrap().is_empty());
}

#[test]
fn root_cn_mismatch_is_not_trusted() {
    let tmp = tempfile::tempdir().unwrap();
    let notary = MemoryNotary::new();
    let mut collection = initialized_collection(tmp.path(), &notary);
    collection.publish().expect("publish");

    // A second collection under a different GUN shares the trust store and
    // the remote. The served root's certificate names the original GUN, so
    // validation must not produce any trusted key.
    let mut other = Collection::open(
        CollectionSettings::new("example.com/library/other", tmp.path()),
        Box::new(Arc::clone(&notary)),
        Box::new(StaticPassphrase::new(TEST_PASSPHRASE)),
    )
    .unwrap();
    assert!(matches!(
        other.publish(),
        Err(Error::NoTrustedRoot { .. })
    ));
}

#[test]
fn near_expiry_root_is_resigned() {
    let tmp = tempfile::tempdir().unwrap();
    let notary = MemoryNotary::new();
    let mut collection = initialized_collection(tmp.path(), &notary);
    collection.publish().expect("first publish");

    // Root now expires in one hour; the safety window is 24 hours.
    age_local_root(tmp.path(), 1);
    notary.clear();

    let mut settings = CollectionSettings::new(GUN, tmp.path());
    settings.root_safety_window = Duration::hours(24);
    let mut collection = Collection::open(
        settings,
        Box::new(Arc::clone(&notary)),
        Box::new(StaticPassphrase::new(TEST_PASSPHRASE)),
    )
    .unwrap();
    collection.publish().expect("near-expiry publish");

    assert_eq!(notary.uploads(), ["root", "targets", "snapshot"]);
    let root: Signed<Root> = serde_json::from_slice(&notary.meta("root").unwrap()).unwrap();
    assert_eq!(root.signed.version.get(), 2);
    assert!(root.signed.expires > Utc::now() + Duration::days(3000));
}

#[test]
fn distant_expiry_root_is_left_alone() {
    let tmp = tempfile::tempdir().unwrap();
    let notary = MemoryNotary::new();
    let mut collection = initialized_collection(tmp.path(), &notary);
    collection.publish().expect("first publish");
    notary.clear();

    let mut collection = open_collection(tmp.path(), &notary, TEST_PASSPHRASE);
    collection.publish().expect("second publish");

    let root: Signed<Root> = serde_json::from_slice(&notary.meta("root").unwrap()).unwrap();
    assert_eq!(root.signed.version.get(), 1);
}

#[test]
fn bad_passphrase_leaves_everything_intact() {
    let tmp = tempfile::tempdir().unwrap();
    let notary = MemoryNotary::new();
    let mut collection = initialized_collection(tmp.path(), &notary);
    collection.publish().expect("first publish");

    // Force a root re-sign on the next publish, then get the passphrase
    // wrong.
    age_local_root(tmp.path(), 1);
    notary.clear();

    let mut collection = open_collection(tmp.path(), &notary, "not the passphrase");
    let payload = tmp.path().join("data.bin");
    fs::write(&payload, b"abc\n").unwrap();
    collection
        .add_target("app/v2", &Target::from_path(&payload).unwrap())
        .unwrap();

    assert!(matches!(
        collection.publish(),
        Err(Error::WrongPassphrase { .. })
    ));

    // The changelist is intact and replayable; nothing reached the remote.
    assert_eq!(changelist_entries(tmp.path()), 1);
    assert!(notary.uploads().is_empty());
}

#[test]
fn oversized_root_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let notary = MemoryNotary::new();
    let collection = initialized_collection(tmp.path(), &notary);

    notary.put_meta("root", vec![b'{'; 6 * 1024 * 1024]);
    assert!(matches!(
        collection.list_targets(),
        Err(Error::MaxSizeExceeded { .. })
    ));
}
