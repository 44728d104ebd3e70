// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provides the TUF engine: the in-memory signed roles for a collection, a
//! verified key database, and role-specific signing and verification.

use crate::error::{self, Result};
use crate::schema::decoded::{Decoded, Hex};
use crate::schema::key::{Key, KeyAlgorithm};
use crate::schema::{
    Hashes, Role, RoleKeys, RoleType, Root, Signature, Signed, Snapshot, SnapshotMeta, Target,
    Targets, Timestamp,
};
use chrono::{DateTime, Duration, Utc};
use log::debug;
use snafu::{ensure, OptionExt};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroU64;

/// The default lifetime of a role signed by this client, from now.
pub(crate) fn default_expires(role: RoleType) -> DateTime<Utc> {
    Utc::now()
        + match role {
            RoleType::Root => Duration::days(10 * 365),
            RoleType::Targets | RoleType::Snapshot => Duration::days(3 * 365),
            RoleType::Timestamp => Duration::days(14),
        }
}

/// The signing service contract the engine uses: key creation and payload
/// signing, with key custody and passphrase handling behind it.
pub trait CryptoService {
    /// Creates and stores a new key for a role, returning its public half.
    fn create(&self, role: RoleType, algorithm: KeyAlgorithm) -> Result<Key>;

    /// Signs `payload` with whichever of `keyids` the service holds keys
    /// for. Returns at least one signature or fails.
    fn sign(
        &self,
        role: RoleType,
        keyids: &[Decoded<Hex>],
        payload: &[u8],
    ) -> Result<Vec<Signature>>;
}

/// A database of verified public keys and the role records that use them.
#[derive(Debug, Clone, Default)]
pub struct KeyDb {
    keys: HashMap<Decoded<Hex>, Key>,
    roles: HashMap<RoleType, RoleKeys>,
}

impl KeyDb {
    /// Creates an empty key database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a key database from a root role's key and role lists,
    /// validating each role record.
    pub fn from_root(root: &Root) -> Result<Self> {
        let mut db = Self::new();
        for (keyid, key) in &root.keys {
            db.add_key(keyid.clone(), key.clone());
        }
        for (role, role_keys) in &root.roles {
            db.add_role(*role, role_keys.clone())?;
        }
        Ok(db)
    }

    /// Adds a public key.
    pub fn add_key(&mut self, keyid: Decoded<Hex>, key: Key) {
        self.keys.insert(keyid, key);
    }

    /// Adds a role record, enforcing that it lists at least one key and that
    /// its threshold is satisfiable.
    pub fn add_role(&mut self, role: RoleType, role_keys: RoleKeys) -> Result<()> {
        ensure!(
            !role_keys.keyids.is_empty(),
            error::NoRoleKeysSnafu { role }
        );
        ensure!(
            role_keys.threshold.get() <= role_keys.keyids.len() as u64,
            error::ThresholdInvalidSnafu {
                role,
                threshold: role_keys.threshold.get(),
                keys: role_keys.keyids.len() as u64,
            }
        );
        self.roles.insert(role, role_keys);
        Ok(())
    }

    /// The key list for a role.
    pub fn role_keys(&self, role: RoleType) -> Result<&RoleKeys> {
        self.roles.get(&role).context(error::NoRoleKeysSnafu { role })
    }

    /// The public key with the given ID, if known.
    pub fn key(&self, keyid: &Decoded<Hex>) -> Option<&Key> {
        self.keys.get(keyid)
    }

    /// All keys known to the database.
    pub fn keys(&self) -> &HashMap<Decoded<Hex>, Key> {
        &self.keys
    }

    /// All role records known to the database.
    pub fn roles(&self) -> &HashMap<RoleType, RoleKeys> {
        &self.roles
    }

    /// Verifies that `signed` carries at least threshold-many valid
    /// signatures from the keys listed for its role.
    pub fn verify_role<T: Role>(&self, signed: &Signed<T>) -> Result<()> {
        let role_keys = self.role_keys(T::TYPE)?;
        let payload = signed.signed.canonical_form()?;
        let valid = count_valid_signatures(
            &payload,
            &signed.signatures,
            &role_keys.keyids,
            &self.keys,
        );
        ensure!(
            valid >= role_keys.threshold.get(),
            error::SignatureThresholdSnafu {
                role: T::TYPE,
                valid,
                threshold: role_keys.threshold.get(),
            }
        );
        Ok(())
    }
}

/// Counts distinct valid signatures over `payload` made by keys that are
/// both listed in `keyids` and present in `keys`. Each key ID counts once.
pub(crate) fn count_valid_signatures(
    payload: &[u8],
    signatures: &[Signature],
    keyids: &[Decoded<Hex>],
    keys: &HashMap<Decoded<Hex>, Key>,
) -> u64 {
    let mut seen: HashSet<&Decoded<Hex>> = HashSet::new();
    let mut valid = 0;
    for signature in signatures {
        if !keyids.contains(&signature.keyid) || seen.contains(&signature.keyid) {
            continue;
        }
        if let Some(key) = keys.get(&signature.keyid) {
            if key.verify(payload, &signature.sig) {
                seen.insert(&signature.keyid);
                valid += 1;
            }
        }
    }
    valid
}

/// A signed role plus its dirty flag. A role is dirty when it has been
/// mutated since it was last signed (or has never been signed); transitions
/// happen only through the engine's `set_*`, mutation, and `sign_*` calls.
#[derive(Debug, Clone)]
pub struct TrackedRole<T> {
    /// The signed role document.
    pub signed: Signed<T>,
    /// Whether the document has unsigned mutations.
    pub dirty: bool,
}

/// The in-memory TUF state of one collection: the four top-level roles (the
/// timestamp role is only ever installed, never signed, because the server
/// holds its key) and the key database they verify against.
#[derive(Debug)]
pub struct TufEngine {
    keydb: KeyDb,
    consistent_snapshot: bool,
    root: Option<TrackedRole<Root>>,
    targets: Option<TrackedRole<Targets>>,
    snapshot: Option<TrackedRole<Snapshot>>,
    timestamp: Option<Signed<Timestamp>>,
}

impl TufEngine {
    /// Creates an engine over a key database.
    pub fn new(keydb: KeyDb, consistent_snapshot: bool) -> Self {
        Self {
            keydb,
            consistent_snapshot,
            root: None,
            targets: None,
            snapshot: None,
            timestamp: None,
        }
    }

    /// The key database.
    pub fn keydb(&self) -> &KeyDb {
        &self.keydb
    }

    /// Seeds fresh root, targets, and snapshot roles at version 1 from the
    /// key database. The new roles are unsigned and therefore dirty.
    pub fn init_repo(&mut self) -> Result<()> {
        let version = NonZeroU64::MIN;
        let root = Root {
            consistent_snapshot: self.consistent_snapshot,
            version,
            expires: default_expires(RoleType::Root),
            keys: self.keydb.keys().clone(),
            roles: self.keydb.roles().clone(),
            _extra: HashMap::new(),
        };
        self.root = Some(TrackedRole {
            signed: Signed {
                signed: root,
                signatures: Vec::new(),
            },
            dirty: true,
        });
        self.targets = Some(TrackedRole {
            signed: Signed {
                signed: Targets::new(version, default_expires(RoleType::Targets)),
                signatures: Vec::new(),
            },
            dirty: true,
        });
        self.snapshot = Some(TrackedRole {
            signed: Signed {
                signed: Snapshot::new(version, default_expires(RoleType::Snapshot)),
                signatures: Vec::new(),
            },
            dirty: true,
        });
        Ok(())
    }

    /// Installs a verified root role (clean).
    pub fn set_root(&mut self, signed: Signed<Root>) {
        self.consistent_snapshot = signed.signed.consistent_snapshot;
        self.root = Some(TrackedRole {
            signed,
            dirty: false,
        });
    }

    /// Installs a verified targets role (clean).
    pub fn set_targets(&mut self, signed: Signed<Targets>) {
        self.targets = Some(TrackedRole {
            signed,
            dirty: false,
        });
    }

    /// Installs a verified snapshot role (clean).
    pub fn set_snapshot(&mut self, signed: Signed<Snapshot>) {
        self.snapshot = Some(TrackedRole {
            signed,
            dirty: false,
        });
    }

    /// Installs a verified timestamp role.
    pub fn set_timestamp(&mut self, signed: Signed<Timestamp>) {
        self.timestamp = Some(signed);
    }

    /// The current root role.
    pub fn root(&self) -> Result<&TrackedRole<Root>> {
        self.root.as_ref().context(error::RoleNotLoadedSnafu {
            role: RoleType::Root,
        })
    }

    /// The current targets role.
    pub fn targets(&self) -> Result<&TrackedRole<Targets>> {
        self.targets.as_ref().context(error::RoleNotLoadedSnafu {
            role: RoleType::Targets,
        })
    }

    /// The current snapshot role.
    pub fn snapshot(&self) -> Result<&TrackedRole<Snapshot>> {
        self.snapshot.as_ref().context(error::RoleNotLoadedSnafu {
            role: RoleType::Snapshot,
        })
    }

    /// The current timestamp role, if one has been installed.
    pub fn timestamp(&self) -> Option<&Signed<Timestamp>> {
        self.timestamp.as_ref()
    }

    /// Adds a target to the targets role, marking it dirty.
    pub fn add_target(&mut self, name: &str, target: Target) -> Result<()> {
        let targets = self.targets.as_mut().context(error::RoleNotLoadedSnafu {
            role: RoleType::Targets,
        })?;
        targets.signed.signed.add_target(name, target);
        targets.dirty = true;
        Ok(())
    }

    /// Removes a target from the targets role, marking it dirty.
    pub fn remove_target(&mut self, name: &str) -> Result<()> {
        let targets = self.targets.as_mut().context(error::RoleNotLoadedSnafu {
            role: RoleType::Targets,
        })?;
        targets.signed.signed.remove_target(name);
        targets.dirty = true;
        Ok(())
    }

    /// Re-signs the root role with a fresh expiry, advancing its version if
    /// it was previously signed.
    pub fn sign_root(&mut self, expires: DateTime<Utc>, crypto: &dyn CryptoService) -> Result<()> {
        let keyids = self.keydb.role_keys(RoleType::Root)?.keyids.clone();
        let root = self.root.as_mut().context(error::RoleNotLoadedSnafu {
            role: RoleType::Root,
        })?;
        sign_role(&mut root.signed, RoleType::Root, &keyids, expires, crypto)?;
        root.dirty = false;
        debug!("signed root version {}", root.signed.signed.version);
        Ok(())
    }

    /// Re-signs the targets role with a fresh expiry, advancing its version
    /// if it was previously signed.
    pub fn sign_targets(
        &mut self,
        expires: DateTime<Utc>,
        crypto: &dyn CryptoService,
    ) -> Result<()> {
        let keyids = self.keydb.role_keys(RoleType::Targets)?.keyids.clone();
        let targets = self.targets.as_mut().context(error::RoleNotLoadedSnafu {
            role: RoleType::Targets,
        })?;
        sign_role(
            &mut targets.signed,
            RoleType::Targets,
            &keyids,
            expires,
            crypto,
        )?;
        targets.dirty = false;
        debug!("signed targets version {}", targets.signed.signed.version);
        Ok(())
    }

    /// Re-signs the snapshot role with a fresh expiry, advancing its version
    /// if it was previously signed. The snapshot's `meta` entries for
    /// `root.json` and `targets.json` are recomputed from the current signed
    /// roles first, so sign root and targets before calling this.
    pub fn sign_snapshot(
        &mut self,
        expires: DateTime<Utc>,
        crypto: &dyn CryptoService,
    ) -> Result<()> {
        let root_meta = snapshot_meta(&self.root()?.signed)?;
        let targets_meta = snapshot_meta(&self.targets()?.signed)?;

        let keyids = self.keydb.role_keys(RoleType::Snapshot)?.keyids.clone();
        let snapshot = self.snapshot.as_mut().context(error::RoleNotLoadedSnafu {
            role: RoleType::Snapshot,
        })?;
        snapshot
            .signed
            .signed
            .meta
            .insert("root.json".to_string(), root_meta);
        snapshot
            .signed
            .signed
            .meta
            .insert("targets.json".to_string(), targets_meta);

        sign_role(
            &mut snapshot.signed,
            RoleType::Snapshot,
            &keyids,
            expires,
            crypto,
        )?;
        snapshot.dirty = false;
        debug!("signed snapshot version {}", snapshot.signed.signed.version);
        Ok(())
    }
}

/// Describes a signed role the way snapshot metadata records it: the length,
/// sha256, and version of its canonical wire form.
pub(crate) fn snapshot_meta<T: Role>(signed: &Signed<T>) -> Result<SnapshotMeta> {
    let bytes = signed.canonical_bytes()?;
    Ok(SnapshotMeta {
        length: Some(bytes.len() as u64),
        hashes: Some(Hashes {
            sha256: crate::io::sha256(&bytes).into(),
            _extra: HashMap::new(),
        }),
        version: signed.signed.version(),
        _extra: HashMap::new(),
    })
}

/// Common signing path: refresh the expiry, advance the version if the role
/// was previously signed, and replace the signature set.
fn sign_role<T: Role + VersionedRole>(
    signed: &mut Signed<T>,
    role: RoleType,
    keyids: &[Decoded<Hex>],
    expires: DateTime<Utc>,
    crypto: &dyn CryptoService,
) -> Result<()> {
    if !signed.signatures.is_empty() {
        let version = signed
            .signed
            .version()
            .checked_add(1)
            .context(error::VersionOverflowSnafu)?;
        signed.signed.set_version(version);
    }
    signed.signed.set_expires(expires);

    let payload = signed.signed.canonical_form()?;
    let signatures = crypto.sign(role, keyids, &payload)?;
    signed.signatures = signatures;
    Ok(())
}

/// Write access to the version and expiry fields shared by all roles.
pub(crate) trait VersionedRole {
    fn set_version(&mut self, version: NonZeroU64);
    fn set_expires(&mut self, expires: DateTime<Utc>);
}

macro_rules! impl_versioned_role {
    ($($role:ty),*) => {
        $(impl VersionedRole for $role {
            fn set_version(&mut self, version: NonZeroU64) {
                self.version = version;
            }

            fn set_expires(&mut self, expires: DateTime<Utc>) {
                self.expires = expires;
            }
        })*
    };
}

impl_versioned_role!(Root, Targets, Snapshot, Timestamp);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custody::{KeyCustody, StaticPassphrase};

    fn engine_with_custody(dir: &std::path::Path) -> (TufEngine, KeyCustody) {
        let custody = KeyCustody::open(dir, Box::new(StaticPassphrase::new("hunter2")));
        let mut keydb = KeyDb::new();
        for role in [
            RoleType::Root,
            RoleType::Targets,
            RoleType::Snapshot,
            RoleType::Timestamp,
        ] {
            let key = custody.create(role, KeyAlgorithm::Ecdsa).unwrap();
            let keyid = key.key_id().unwrap();
            keydb.add_key(keyid.clone(), key);
            keydb
                .add_role(
                    role,
                    RoleKeys {
                        keyids: vec![keyid],
                        threshold: NonZeroU64::MIN,
                        _extra: HashMap::new(),
                    },
                )
                .unwrap();
        }
        (TufEngine::new(keydb, false), custody)
    }

    #[test]
    fn first_sign_keeps_version_one() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut engine, custody) = engine_with_custody(tmp.path());
        engine.init_repo().unwrap();
        assert!(engine.targets().unwrap().dirty);

        engine
            .sign_targets(default_expires(RoleType::Targets), &custody)
            .unwrap();
        let targets = engine.targets().unwrap();
        assert_eq!(targets.signed.signed.version.get(), 1);
        assert!(!targets.dirty);

        // A later re-sign advances the version by exactly one.
        engine
            .sign_targets(default_expires(RoleType::Targets), &custody)
            .unwrap();
        assert_eq!(engine.targets().unwrap().signed.signed.version.get(), 2);
    }

    #[test]
    fn signed_roles_verify_against_keydb() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut engine, custody) = engine_with_custody(tmp.path());
        engine.init_repo().unwrap();
        engine
            .sign_root(default_expires(RoleType::Root), &custody)
            .unwrap();
        engine
            .sign_targets(default_expires(RoleType::Targets), &custody)
            .unwrap();
        engine
            .sign_snapshot(default_expires(RoleType::Snapshot), &custody)
            .unwrap();

        let keydb = engine.keydb().clone();
        keydb.verify_role(&engine.root().unwrap().signed).unwrap();
        keydb.verify_role(&engine.targets().unwrap().signed).unwrap();
        keydb.verify_role(&engine.snapshot().unwrap().signed).unwrap();
    }

    #[test]
    fn snapshot_meta_matches_serialized_targets() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut engine, custody) = engine_with_custody(tmp.path());
        engine.init_repo().unwrap();
        engine
            .sign_root(default_expires(RoleType::Root), &custody)
            .unwrap();
        engine
            .sign_targets(default_expires(RoleType::Targets), &custody)
            .unwrap();
        engine
            .sign_snapshot(default_expires(RoleType::Snapshot), &custody)
            .unwrap();

        let targets_bytes = engine.targets().unwrap().signed.canonical_bytes().unwrap();
        let meta = &engine.snapshot().unwrap().signed.signed.meta["targets.json"];
        assert_eq!(meta.length, Some(targets_bytes.len() as u64));
        crate::io::verify_sha256(
            &targets_bytes,
            meta.hashes.as_ref().unwrap().sha256.as_ref(),
            "test",
        )
        .unwrap();
        assert_eq!(meta.version.get(), 1);
    }

    #[test]
    fn mutation_marks_targets_dirty() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut engine, custody) = engine_with_custody(tmp.path());
        engine.init_repo().unwrap();
        engine
            .sign_targets(default_expires(RoleType::Targets), &custody)
            .unwrap();
        assert!(!engine.targets().unwrap().dirty);

        engine
            .add_target(
                "app/v1",
                Target {
                    length: 6,
                    hashes: Hashes {
                        sha256: vec![0; 32].into(),
                        _extra: HashMap::new(),
                    },
                    custom: HashMap::new(),
                    _extra: HashMap::new(),
                },
            )
            .unwrap();
        assert!(engine.targets().unwrap().dirty);
    }

    #[test]
    fn threshold_must_be_satisfiable() {
        let mut keydb = KeyDb::new();
        let key = Key::new(KeyAlgorithm::Ecdsa, b"pub".to_vec());
        let keyid = key.key_id().unwrap();
        keydb.add_key(keyid.clone(), key);
        assert!(matches!(
            keydb.add_role(
                RoleType::Root,
                RoleKeys {
                    keyids: vec![keyid],
                    threshold: NonZeroU64::new(2).unwrap(),
                    _extra: HashMap::new(),
                },
            ),
            Err(crate::error::Error::ThresholdInvalid { .. })
        ));
    }
}
