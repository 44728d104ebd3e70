// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0


use signet::custody::StaticPassphrase;
use signet::engine::KeyDb;
use signet::error::Error;
use signet::schema::key::{Key, KeyAlgorithm};
use signet::schema::{Root, RoleType, Signed, Snapshot, Targets};
use signet::{Collection, CollectionSettings};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use test_utils::{MemoryNotary, TEST_PASSPHRASE};

const GUN: &str = "example.com/library/app";

fn open_collection(base: &Path, notary: &Arc<test_utils::MemoryNotary>) -> Collection {
    Collection::open(
        CollectionSettings::new(GUN, base),
        Box::new(Arc::clone(notary)),
        Box::new(StaticPassphrase::new(TEST_PASSPHRASE)),
    )
    .expect("open collection")
}

fn local_meta(base: &Path, role: &str) -> Vec<u8> {
    fs::read(
        base.join("tuf")
            .join(GUN)
            .join("metadata")
            .join(format!("{}.json", role)),
    )
    .expect("local metadata")
}

#[test]
fn cold_init_with_rsa_root() {
    let tmp = tempfile::tempdir().unwrap();
    let notary = MemoryNotary::new();
    let mut collection = open_collection(tmp.path(), &notary);

    let signer = collection
        .create_root_key(KeyAlgorithm::Rsa)
        .expect("RSA-4096 root key");
    collection.initialize(&signer).expect("initialize");

    // The minted certificate landed in the trust store, named by its
    // fingerprint.
    let certs: Vec<_> = fs::read_dir(tmp.path().join("trusted_certificates"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().map_or(false, |ext| ext == "pem"))
        .collect();
    assert_eq!(certs.len(), 1);

    // root.json verifies under the freshly minted root, and the root key
    // carries the X.509 envelope.
    let root: Signed<Root> = serde_json::from_slice(&local_meta(tmp.path(), "root")).unwrap();
    assert_eq!(root.signed.version.get(), 1);
    let keydb = KeyDb::from_root(&root.signed).unwrap();
    keydb.verify_role(&root).unwrap();
    let (_, root_key) = root.signed.keys(RoleType::Root).next().unwrap();
    assert!(matches!(root_key, Key::RsaX509 { .. }));

    // Targets and snapshot exist at version 1 with no targets, and verify
    // against the same root.
    let targets: Signed<Targets> =
        serde_json::from_slice(&local_meta(tmp.path(), "targets")).unwrap();
    assert_eq!(targets.signed.version.get(), 1);
    assert!(targets.signed.targets.is_empty());
    keydb.verify_role(&targets).unwrap();

    let snapshot: Signed<Snapshot> =
        serde_json::from_slice(&local_meta(tmp.path(), "snapshot")).unwrap();
    assert_eq!(snapshot.signed.version.get(), 1);
    keydb.verify_role(&snapshot).unwrap();

    // All four roles are recorded with threshold 1, timestamp's key being
    // the server's.
    for role in [
        RoleType::Root,
        RoleType::Targets,
        RoleType::Snapshot,
        RoleType::Timestamp,
    ] {
        let role_keys = root.signed.role_keys(role).unwrap();
        assert_eq!(role_keys.threshold.get(), 1);
        assert_eq!(role_keys.keyids.len(), 1);
    }
}

#[test]
fn x509_root_algorithm_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let notary = MemoryNotary::new();
    let collection = open_collection(tmp.path(), &notary);
    assert!(matches!(
        collection.create_root_key(KeyAlgorithm::RsaX509),
        Err(Error::InvalidKeyAlgorithm { .. })
    ));
}

/// A remote whose key endpoint is down.
#[derive(Debug)]
struct KeylessRemote;

impl signet::MetadataStore for KeylessRemote {
    fn get_meta(&self, role: &str, _max_size: u64) -> signet::Result<Vec<u8>> {
        signet::error::MetaNotFoundSnafu { role }.fail()
    }

    fn set_meta(&self, _role: &str, _bytes: &[u8]) -> signet::Result<()> {
        Ok(())
    }
}

impl signet::RemoteStore for KeylessRemote {
    fn get_key(&self, _role: &str) -> signet::Result<Key> {
        signet::error::RemoteUnavailableSnafu {
            url: "<test>".to_string(),
            reason: "key endpoint down".to_string(),
        }
        .fail()
    }
}

#[test]
fn initialize_propagates_missing_server_key() {
    let tmp = tempfile::tempdir().unwrap();
    let mut collection = Collection::open(
        CollectionSettings::new(GUN, tmp.path()),
        Box::new(KeylessRemote),
        Box::new(StaticPassphrase::new(TEST_PASSPHRASE)),
    )
    .unwrap();

    let signer = collection.create_root_key(KeyAlgorithm::Ecdsa).unwrap();
    assert!(matches!(
        collection.initialize(&signer),
        Err(Error::RemoteUnavailable { .. })
    ));

    // No partial "initialized" marker: the metadata directory was never
    // written.
    assert!(!tmp.path().join("tuf").join(GUN).join("metadata").exists());
}
