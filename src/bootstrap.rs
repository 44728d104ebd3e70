// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provides the trust-bootstrap path: validating a downloaded root against
//! the on-disk trust store, establishing a verified key database, and
//! pulling the non-root roles through a `PullClient`.

use crate::engine::{count_valid_signatures, KeyDb, TufEngine};
use crate::error::{self, Result};
use crate::io::verify_sha256;
use crate::remote::RemoteStore;
use crate::schema::decoded::{Decoded, Hex};
use crate::schema::key::Key;
use crate::schema::{Role, RoleType, Root, Signed, Snapshot, Targets, Timestamp};
use crate::store::MetadataStore;
use crate::trust::{fingerprint, TrustStore};
use crate::Limits;
use chrono::Utc;
use log::debug;
use snafu::{ensure, ResultExt};
use std::collections::HashMap;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

/// Validates a downloaded root envelope against the trust store for `gun`.
///
/// A key listed for the root role is accepted into the trusted set if either
/// its leaf certificate's fingerprint resolves in the leaf certificate store
/// and the certificate common name equals the GUN, or the leaf chains to a
/// CA anchor for the GUN. Returns the trusted keys; an empty set is the
/// `NoTrustedRoot` error.
pub(crate) fn validate_root(
    trust: &TrustStore,
    signed: &Signed<Root>,
    gun: &str,
) -> Result<HashMap<Decoded<Hex>, Key>> {
    let mut trusted = HashMap::new();
    let empty = Vec::new();
    let keyids = signed
        .signed
        .role_keys(RoleType::Root)
        .map(|role_keys| &role_keys.keyids)
        .unwrap_or(&empty);

    for keyid in keyids {
        let key = match signed.signed.keys.get(keyid) {
            Some(key) => key,
            None => continue,
        };
        let pem_text = match key.public_pem() {
            Some(pem_text) => pem_text,
            // A bare (non-certificate) key cannot resolve in the trust store.
            None => continue,
        };
        let leaf_der = match leaf_certificate(pem_text.as_bytes()) {
            Some(der) => der,
            None => continue,
        };

        let fingerprint = fingerprint(&leaf_der);
        let pinned = trust
            .get_by_fingerprint(&fingerprint)
            .map(|entry| entry.common_name == gun)
            .unwrap_or(false);
        if pinned || trust.verify(&leaf_der, gun).is_ok() {
            debug!("accepted root key {} for '{}'", keyid, gun);
            trusted.insert(keyid.clone(), key.clone());
        }
    }

    ensure!(!trusted.is_empty(), error::NoTrustedRootSnafu { gun });
    Ok(trusted)
}

/// Picks the leaf out of the certificate chain in a root key entry: the
/// first certificate that is not a CA, or the first certificate when every
/// entry claims to be a CA.
fn leaf_certificate(pem_bytes: &[u8]) -> Option<Vec<u8>> {
    let mut first = None;
    for pem in x509_parser::pem::Pem::iter_from_buffer(pem_bytes) {
        let pem = match pem {
            Ok(pem) => pem,
            Err(_) => continue,
        };
        if pem.label != "CERTIFICATE" {
            continue;
        }
        if first.is_none() {
            first = Some(pem.contents.clone());
        }
        if let Ok((_, cert)) = X509Certificate::from_der(&pem.contents) {
            if !is_ca(&cert) {
                return Some(pem.contents);
            }
        }
    }
    first
}

fn is_ca(cert: &X509Certificate<'_>) -> bool {
    use x509_parser::extensions::ParsedExtension;
    cert.extensions().iter().any(|ext| {
        matches!(ext.parsed_extension(), ParsedExtension::BasicConstraints(bc) if bc.ca)
    })
}

/// Fetches root metadata from the remote, validates it against the trust
/// store, and returns a pull client over a fresh engine seeded with the
/// verified root.
pub(crate) fn bootstrap_client<'a>(
    remote: &'a dyn RemoteStore,
    trust: &TrustStore,
    gun: &str,
    limits: &'a Limits,
) -> Result<PullClient<'a>> {
    let bytes = remote.get_meta("root", limits.max_root_size)?;
    let signed: Signed<Root> = serde_json::from_slice(&bytes).context(error::ParseMetadataSnafu {
        role: RoleType::Root,
    })?;

    let trusted = validate_root(trust, &signed, gun)?;

    // Bootstrap verification: threshold 1, accept any version.
    let payload = signed.signed.canonical_form()?;
    let keyids: Vec<Decoded<Hex>> = trusted.keys().cloned().collect();
    let valid = count_valid_signatures(&payload, &signed.signatures, &keyids, &trusted);
    ensure!(
        valid >= 1,
        error::RootValidationFailedSnafu {
            gun,
            valid,
            threshold: 1u64,
        }
    );
    ensure!(
        signed.signed.expires > Utc::now(),
        error::ExpiredMetadataSnafu {
            role: RoleType::Root,
            expires: signed.signed.expires,
        }
    );

    let keydb = KeyDb::from_root(&signed.signed)?;
    let mut engine = TufEngine::new(keydb, signed.signed.consistent_snapshot);
    engine.set_root(signed);
    debug!("bootstrapped '{}' from remote root", gun);

    Ok(PullClient {
        remote,
        limits,
        engine,
    })
}

/// Loads root, targets, and snapshot from the local metadata store and seeds
/// an engine without remote contact. Local material is trusted because the
/// user produced it; signatures are not re-verified here.
pub(crate) fn bootstrap_repo(store: &dyn MetadataStore, limits: &Limits) -> Result<TufEngine> {
    let root: Signed<Root> = serde_json::from_slice(&store.get_meta("root", limits.max_root_size)?)
        .context(error::ParseMetadataSnafu {
            role: RoleType::Root,
        })?;
    let targets: Signed<Targets> =
        serde_json::from_slice(&store.get_meta("targets", limits.max_targets_size)?)
            .context(error::ParseMetadataSnafu {
                role: RoleType::Targets,
            })?;
    let snapshot: Signed<Snapshot> =
        serde_json::from_slice(&store.get_meta("snapshot", limits.max_snapshot_size)?)
            .context(error::ParseMetadataSnafu {
                role: RoleType::Snapshot,
            })?;

    let keydb = KeyDb::from_root(&root.signed)?;
    let mut engine = TufEngine::new(keydb, root.signed.consistent_snapshot);
    engine.set_root(root);
    engine.set_targets(targets);
    engine.set_snapshot(snapshot);
    Ok(engine)
}

/// A client over a bootstrapped engine that knows how to fetch and verify
/// the non-root roles from the remote.
#[derive(Debug)]
pub(crate) struct PullClient<'a> {
    remote: &'a dyn RemoteStore,
    limits: &'a Limits,
    engine: TufEngine,
}

impl<'a> PullClient<'a> {
    /// Fetches timestamp, snapshot, and targets in order, verifying each
    /// against the key database (and each fetched document against the
    /// digests the previous one lists for it).
    pub(crate) fn update(&mut self) -> Result<()> {
        let timestamp = self.fetch_timestamp()?;
        let snapshot = self.fetch_snapshot(&timestamp)?;
        self.fetch_targets(&snapshot)?;
        Ok(())
    }

    /// Consumes the client, yielding the engine.
    pub(crate) fn into_engine(self) -> TufEngine {
        self.engine
    }

    fn fetch_timestamp(&mut self) -> Result<Signed<Timestamp>> {
        let bytes = self.remote.get_meta("timestamp", self.limits.max_timestamp_size)?;
        let timestamp: Signed<Timestamp> =
            serde_json::from_slice(&bytes).context(error::ParseMetadataSnafu {
                role: RoleType::Timestamp,
            })?;
        self.engine.keydb().verify_role(&timestamp)?;
        check_expiry(&timestamp.signed)?;
        self.engine.set_timestamp(timestamp.clone());
        Ok(timestamp)
    }

    fn fetch_snapshot(&mut self, timestamp: &Signed<Timestamp>) -> Result<Signed<Snapshot>> {
        let meta = timestamp.signed.meta.get("snapshot.json");
        let max_size = meta
            .and_then(|meta| meta.length)
            .unwrap_or(self.limits.max_snapshot_size);
        let bytes = self.remote.get_meta("snapshot", max_size)?;
        if let Some(hashes) = meta.and_then(|meta| meta.hashes.as_ref()) {
            verify_sha256(&bytes, &hashes.sha256, "timestamp.json")?;
        }

        let snapshot: Signed<Snapshot> =
            serde_json::from_slice(&bytes).context(error::ParseMetadataSnafu {
                role: RoleType::Snapshot,
            })?;
        self.engine.keydb().verify_role(&snapshot)?;
        check_expiry(&snapshot.signed)?;
        if let Some(meta) = meta {
            ensure!(
                snapshot.signed.version == meta.version,
                error::VersionMismatchSnafu {
                    role: RoleType::Snapshot,
                    fetched: snapshot.signed.version.get(),
                    expected: meta.version.get(),
                }
            );
        }
        self.engine.set_snapshot(snapshot.clone());
        Ok(snapshot)
    }

    fn fetch_targets(&mut self, snapshot: &Signed<Snapshot>) -> Result<()> {
        let meta = snapshot.signed.meta.get("targets.json");
        let max_size = meta
            .and_then(|meta| meta.length)
            .unwrap_or(self.limits.max_targets_size);
        let bytes = self.remote.get_meta("targets", max_size)?;
        if let Some(hashes) = meta.and_then(|meta| meta.hashes.as_ref()) {
            verify_sha256(&bytes, &hashes.sha256, "snapshot.json")?;
        }

        let targets: Signed<Targets> =
            serde_json::from_slice(&bytes).context(error::ParseMetadataSnafu {
                role: RoleType::Targets,
            })?;
        self.engine.keydb().verify_role(&targets)?;
        check_expiry(&targets.signed)?;
        if let Some(meta) = meta {
            ensure!(
                targets.signed.version == meta.version,
                error::VersionMismatchSnafu {
                    role: RoleType::Targets,
                    fetched: targets.signed.version.get(),
                    expected: meta.version.get(),
                }
            );
        }
        self.engine.set_targets(targets);
        Ok(())
    }
}

fn check_expiry<T: Role>(role: &T) -> Result<()> {
    ensure!(
        role.expires() > Utc::now(),
        error::ExpiredMetadataSnafu {
            role: T::TYPE,
            expires: role.expires(),
        }
    );
    Ok(())
}

