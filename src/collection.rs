// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provides the `Collection`, the top-level handle for one trust collection:
//! first-time initialization, target ingest, and the publish pipeline.

use crate::bootstrap::{bootstrap_client, bootstrap_repo};
use crate::changelist::{Change, ChangeAction, Changelist};
use crate::custody::{KeyCustody, PassphraseSource, Signer};
use crate::engine::{default_expires, TufEngine};
use crate::error::{self, Error, Result};
use crate::remote::RemoteStore;
use crate::schema::key::{Key, KeyAlgorithm};
use crate::schema::{RoleType, Signed, Target, Targets};
use crate::store::{FilesystemStore, MetadataStore};
use crate::trust::{self, TrustStore};
use crate::CollectionSettings;
use chrono::Utc;
use log::{debug, info};
use snafu::{ensure, OptionExt, ResultExt};
use std::path::PathBuf;

const SHA256_LEN: usize = 32;

/// One content-trust collection: its local state under the base directory
/// and its remote. Two `Collection` instances pointing at the same base
/// directory must not be used concurrently.
#[derive(Debug)]
pub struct Collection {
    settings: CollectionSettings,
    trust: TrustStore,
    custody: KeyCustody,
    store: FilesystemStore,
    changelist_dir: PathBuf,
    remote: Box<dyn RemoteStore>,
}

impl Collection {
    /// Opens a collection rooted at `settings.base_dir`, talking to the
    /// given remote. Nothing is created on disk until `initialize` or the
    /// first journaled change.
    pub fn open(
        settings: CollectionSettings,
        remote: Box<dyn RemoteStore>,
        passphrase: Box<dyn PassphraseSource>,
    ) -> Result<Self> {
        let base = &settings.base_dir;
        let tuf_dir = base.join("tuf").join(&settings.gun);
        let trust = TrustStore::open(base.join("trusted_certificates"))?;
        let custody = KeyCustody::open(base.join("private_keys"), passphrase);
        let store = FilesystemStore::new(tuf_dir.join("metadata"));
        let changelist_dir = tuf_dir.join("changelist");
        Ok(Self {
            settings,
            trust,
            custody,
            store,
            changelist_dir,
            remote,
        })
    }

    /// The collection's GUN.
    pub fn gun(&self) -> &str {
        &self.settings.gun
    }

    /// Generates a root key of the given bare algorithm (RSA or ECDSA),
    /// stores it encrypted, and returns the signing capability `initialize`
    /// consumes.
    pub fn create_root_key(&self, algorithm: KeyAlgorithm) -> Result<Signer> {
        ensure!(
            matches!(algorithm, KeyAlgorithm::Rsa | KeyAlgorithm::Ecdsa),
            error::InvalidKeyAlgorithmSnafu {
                algorithm: algorithm.to_string(),
            }
        );
        self.custody.create_signer(RoleType::Root, algorithm)
    }

    /// First-time repo creation: mints the root certificate, links the root
    /// key, fetches the server timestamp key, generates targets and snapshot
    /// keys, seeds the roles, and persists signed metadata. Metadata writes
    /// are the last step, so a failure leaves no partial "initialized"
    /// marker behind.
    pub fn initialize(&mut self, root_signer: &Signer) -> Result<()> {
        let gun = self.settings.gun.clone();

        // Mint a self-signed certificate over the root public key with
        // subject CN = GUN and install it in the leaf certificate store.
        let cert_pem = trust::mint_certificate(
            root_signer.pkcs8_der(),
            root_signer.algorithm(),
            &gun,
        )?;
        let fingerprint = self.trust.add(&cert_pem)?;

        // The TUF root key entry preserves the X.509 envelope, keyed over
        // the PEM-encoded certificate.
        let x509_algorithm = match root_signer.algorithm() {
            KeyAlgorithm::Rsa => KeyAlgorithm::RsaX509,
            _ => KeyAlgorithm::EcdsaX509,
        };
        let root_key = Key::new(x509_algorithm, cert_pem.into_bytes());
        let root_key_id = root_key.key_id()?;

        // Durable trust links: the certificate fingerprint and the derived
        // root key ID both resolve to the signer's private key.
        let internal = root_signer.key_id().to_string();
        self.custody.link(&fingerprint, &internal)?;
        self.custody.link(&root_key_id.to_string(), &internal)?;

        // The timestamp key is always the server's.
        let timestamp_key = self.remote.get_key("timestamp")?;

        // Targets and snapshot keys are always ECDSA and minted locally.
        let targets_key = self
            .custody
            .create_signer(RoleType::Targets, KeyAlgorithm::Ecdsa)?
            .tuf_key();
        let snapshot_key = self
            .custody
            .create_signer(RoleType::Snapshot, KeyAlgorithm::Ecdsa)?
            .tuf_key();

        let mut keydb = crate::engine::KeyDb::new();
        for (role, key) in [
            (RoleType::Root, &root_key),
            (RoleType::Targets, &targets_key),
            (RoleType::Snapshot, &snapshot_key),
            (RoleType::Timestamp, &timestamp_key),
        ] {
            let keyid = key.key_id()?;
            keydb.add_key(keyid.clone(), key.clone());
            keydb.add_role(
                role,
                crate::schema::RoleKeys {
                    keyids: vec![keyid],
                    threshold: std::num::NonZeroU64::MIN,
                    _extra: std::collections::HashMap::new(),
                },
            )?;
        }

        let mut engine = TufEngine::new(keydb, false);
        engine.init_repo()?;
        engine.sign_root(default_expires(RoleType::Root), &self.custody)?;
        self.snapshot(&mut engine)?;

        // Persistence is last: write all three roles only once signing has
        // fully succeeded.
        self.persist(&engine, true)?;
        info!("initialized collection '{}'", gun);
        Ok(())
    }

    /// Signs targets (initially empty) and snapshot.
    fn snapshot(&self, engine: &mut TufEngine) -> Result<()> {
        engine.sign_targets(default_expires(RoleType::Targets), &self.custody)?;
        engine.sign_snapshot(default_expires(RoleType::Snapshot), &self.custody)?;
        Ok(())
    }

    /// Writes the engine's signed roles to the local metadata store.
    fn persist(&self, engine: &TufEngine, include_root: bool) -> Result<()> {
        if include_root {
            self.store
                .set_meta("root", &engine.root()?.signed.canonical_bytes()?)?;
        }
        self.store
            .set_meta("targets", &engine.targets()?.signed.canonical_bytes()?)?;
        self.store
            .set_meta("snapshot", &engine.snapshot()?.signed.canonical_bytes()?)?;
        Ok(())
    }

    /// Journals a create-change adding `target` under `name` to the targets
    /// role. The change takes effect on the next `publish`.
    pub fn add_target(&mut self, name: &str, target: &Target) -> Result<()> {
        ensure!(
            target.hashes.sha256.len() == SHA256_LEN,
            error::InvalidTargetSnafu {
                name,
                reason: "sha256 digest must be 32 bytes",
            }
        );
        let content = serde_json::to_vec(target).context(error::EncodeSnafu {
            what: format!("target '{}'", name),
        })?;
        self.journal(Change {
            action: ChangeAction::Create,
            scope: RoleType::Targets.to_string(),
            kind: "target".to_string(),
            path: name.to_string(),
            content: content.into(),
        })
    }

    /// Journals a delete-change removing `name` from the targets role.
    pub fn remove_target(&mut self, name: &str) -> Result<()> {
        self.journal(Change {
            action: ChangeAction::Delete,
            scope: RoleType::Targets.to_string(),
            kind: "target".to_string(),
            path: name.to_string(),
            content: Vec::new().into(),
        })
    }

    fn journal(&self, change: Change) -> Result<()> {
        let mut changelist = Changelist::open(&self.changelist_dir)?;
        changelist.add(&change)?;
        changelist.close();
        Ok(())
    }

    /// Publishes pending changes: establishes an engine (remote bootstrap,
    /// falling back to local state when the remote has nothing), applies the
    /// changelist, re-signs root when it nears expiry, re-signs targets and
    /// snapshot unconditionally, uploads a consistent view, and clears the
    /// changelist on success.
    pub fn publish(&mut self) -> Result<()> {
        let gun = self.settings.gun.clone();
        let limits = self.settings.limits;
        let mut update_root = false;

        // Step 1: establish a TUF engine.
        let mut engine = match bootstrap_client(
            self.remote.as_ref(),
            &self.trust,
            &gun,
            &limits,
        ) {
            Ok(mut client) => {
                client.update()?;
                client.into_engine()
            }
            Err(Error::MetaNotFound { .. }) => {
                debug!("remote has no metadata for '{}', using local state", gun);
                ensure!(
                    self.settings.base_dir.is_dir(),
                    error::RepoNotExistSnafu {
                        path: self.settings.base_dir.clone(),
                    }
                );
                update_root = true;
                match bootstrap_repo(&self.store, &limits) {
                    Ok(engine) => engine,
                    Err(Error::MetaNotFound { .. }) => {
                        return error::RepoNotInitializedSnafu { gun }.fail();
                    }
                    Err(err) => return Err(err),
                }
            }
            Err(err) => return Err(err),
        };

        // Step 2: apply the changelist in order. Unknown roles or actions
        // abort before any signing.
        let mut changelist = Changelist::open(&self.changelist_dir)?;
        for change in changelist.iter()? {
            apply_change(&mut engine, &change?)?;
        }
        changelist.close();

        // Step 3: conditional root re-sign, driven by the expiry safety
        // window (no operation mutates the root role between publishes).
        if near_expiry(&engine.root()?.signed.signed, &self.settings) {
            let root_keyid = engine
                .keydb()
                .role_keys(RoleType::Root)?
                .keyids
                .first()
                .context(error::NoRoleKeysSnafu {
                    role: RoleType::Root,
                })?
                .to_string();
            let passphrase = self.custody.passphrase_for(RoleType::Root)?;
            let signer = self.custody.get_decrypted(&root_keyid, &passphrase)?;
            engine.sign_root(default_expires(RoleType::Root), &signer)?;
            update_root = true;
            info!("re-signed root for '{}'", gun);
        }

        // Step 4: mandatory re-sign of targets and snapshot, so the remote's
        // server-computed timestamp stays consistent.
        self.snapshot(&mut engine)?;

        // Step 5: marshal everything before sending anything.
        let root_bytes = engine.root()?.signed.canonical_bytes()?;
        let targets_bytes = engine.targets()?.signed.canonical_bytes()?;
        let snapshot_bytes = engine.snapshot()?.signed.canonical_bytes()?;

        // Step 6: upload, root first when it changed.
        if update_root {
            self.remote.set_meta("root", &root_bytes)?;
        }
        self.remote.set_meta("targets", &targets_bytes)?;
        self.remote.set_meta("snapshot", &snapshot_bytes)?;

        // Step 7: persist locally and clear the journal.
        self.persist(&engine, update_root)?;
        changelist.clear()?;
        info!(
            "published '{}' (targets version {})",
            gun,
            engine.targets()?.signed.signed.version
        );
        Ok(())
    }

    /// Bootstraps from the remote, pulls the current roles, and returns all
    /// target entries of the signed targets role.
    pub fn list_targets(&self) -> Result<Vec<(String, Target)>> {
        let targets = self.current_targets()?;
        let mut entries: Vec<(String, Target)> = targets.signed.targets.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    /// Returns the named target from the current signed targets role.
    pub fn get_target_by_name(&self, name: &str) -> Result<Target> {
        let targets = self.current_targets()?;
        Ok(targets.signed.find_target(name)?.clone())
    }

    fn current_targets(&self) -> Result<Signed<Targets>> {
        let mut client = bootstrap_client(
            self.remote.as_ref(),
            &self.trust,
            &self.settings.gun,
            &self.settings.limits,
        )?;
        client.update()?;
        let engine = client.into_engine();
        Ok(engine.targets()?.signed.clone())
    }
}

/// True when the role is within the configured safety window of expiry
/// (remaining validity less than or equal to the window).
fn near_expiry(root: &crate::schema::Root, settings: &CollectionSettings) -> bool {
    Utc::now() + settings.root_safety_window >= root.expires
}

/// Applies one journaled change to the engine.
fn apply_change(engine: &mut TufEngine, change: &Change) -> Result<()> {
    if change.scope != RoleType::Targets.to_string() || change.kind != "target" {
        return error::ChangeUnknownSnafu {
            scope: change.scope.clone(),
            action: change.action.to_string(),
        }
        .fail();
    }
    match change.action {
        ChangeAction::Create | ChangeAction::Update => {
            let target: Target =
                serde_json::from_slice(&change.content).map_err(|err| {
                    error::ChangelistCorruptSnafu {
                        path: PathBuf::from(&change.path),
                        reason: err.to_string(),
                    }
                    .build()
                })?;
            engine.add_target(&change.path, target)
        }
        ChangeAction::Delete => engine.remove_target(&change.path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custody::StaticPassphrase;
    use crate::schema::Hashes;
    use std::collections::HashMap;

    /// A remote that has nothing and accepts nothing.
    #[derive(Debug)]
    struct UnreachableRemote;

    impl MetadataStore for UnreachableRemote {
        fn get_meta(&self, role: &str, _max_size: u64) -> Result<Vec<u8>> {
            error::MetaNotFoundSnafu { role }.fail()
        }

        fn set_meta(&self, _role: &str, _bytes: &[u8]) -> Result<()> {
            error::RemoteUnavailableSnafu {
                url: "<test>".to_string(),
                reason: "unreachable".to_string(),
            }
            .fail()
        }
    }

    impl RemoteStore for UnreachableRemote {
        fn get_key(&self, role: &str) -> Result<Key> {
            error::MetaNotFoundSnafu { role }.fail()
        }
    }

    fn test_collection(base: &std::path::Path) -> Collection {
        Collection::open(
            CollectionSettings::new("example/app", base),
            Box::new(UnreachableRemote),
            Box::new(StaticPassphrase::new("hunter2")),
        )
        .unwrap()
    }

    #[test]
    fn near_expiry_boundary() {
        let settings = CollectionSettings::new("g", "/tmp");
        let mut root = crate::schema::Root {
            consistent_snapshot: false,
            version: std::num::NonZeroU64::MIN,
            expires: Utc::now() + chrono::Duration::days(8),
            keys: HashMap::new(),
            roles: HashMap::new(),
            _extra: HashMap::new(),
        };
        assert!(!near_expiry(&root, &settings));

        root.expires = Utc::now() + chrono::Duration::days(6);
        assert!(near_expiry(&root, &settings));
    }

    #[test]
    fn short_sha256_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut collection = test_collection(tmp.path());
        let target = Target {
            length: 1,
            hashes: Hashes {
                sha256: vec![0u8; 16].into(),
                _extra: HashMap::new(),
            },
            custom: HashMap::new(),
            _extra: HashMap::new(),
        };
        assert!(matches!(
            collection.add_target("app/v1", &target),
            Err(Error::InvalidTarget { .. })
        ));
        // Nothing may be journaled by a rejected target.
        assert!(!tmp.path().join("tuf/example/app/changelist").exists());
    }

    #[test]
    fn publish_without_any_state_reports_uninitialized() {
        let tmp = tempfile::tempdir().unwrap();
        let mut collection = test_collection(tmp.path());
        assert!(matches!(
            collection.publish(),
            Err(Error::RepoNotInitialized { .. })
        ));
    }

    #[test]
    fn publish_without_a_directory_reports_nonexistent() {
        let tmp = tempfile::tempdir().unwrap();
        let mut collection = test_collection(&tmp.path().join("missing"));
        assert!(matches!(
            collection.publish(),
            Err(Error::RepoNotExist { .. })
        ));
    }

    #[test]
    fn unknown_change_scope_aborts() {
        let change = Change {
            action: ChangeAction::Create,
            scope: "timestamp".to_string(),
            kind: "target".to_string(),
            path: "x".to_string(),
            content: b"{}".to_vec().into(),
        };
        let mut engine = TufEngine::new(crate::engine::KeyDb::new(), false);
        assert!(matches!(
            apply_change(&mut engine, &change),
            Err(Error::ChangeUnknown { .. })
        ));
    }
}
