// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provides `KeyCustody`, the store of encrypted private keys backing a
//! collection. Keys are held as encrypted PKCS#8 PEM files named by key ID;
//! trust links (certificate fingerprint or derived key ID → backing key) are
//! durable symlinks in the same directory.

use crate::engine::CryptoService;
use crate::error::{self, Result};
use crate::schema::decoded::{Decoded, Hex};
use crate::schema::key::{Key, KeyAlgorithm};
use crate::schema::{RoleType, Signature};
use crate::sign::{self, Sign, SignKeyPair};
use aws_lc_rs::rand::SystemRandom;
use log::debug;
use snafu::{ensure, ResultExt};
use std::fmt;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// A source of passphrases for encrypted private keys, supplied by the
/// caller (an interactive prompt, an environment lookup, a fixed secret).
pub trait PassphraseSource: fmt::Debug {
    /// Returns the passphrase guarding keys for the given role.
    fn passphrase(&self, role: RoleType) -> Result<Zeroizing<String>>;
}

/// A `PassphraseSource` that always returns the same passphrase.
#[derive(Clone)]
pub struct StaticPassphrase {
    passphrase: Zeroizing<String>,
}

impl StaticPassphrase {
    /// Creates a source over a fixed passphrase.
    pub fn new<S: Into<String>>(passphrase: S) -> Self {
        Self {
            passphrase: Zeroizing::new(passphrase.into()),
        }
    }
}

impl fmt::Debug for StaticPassphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StaticPassphrase")
    }
}

impl PassphraseSource for StaticPassphrase {
    fn passphrase(&self, _role: RoleType) -> Result<Zeroizing<String>> {
        Ok(self.passphrase.clone())
    }
}

/// A short-lived signing capability: one decrypted private key tied to the
/// key ID it serves. The decrypted PKCS#8 buffer is zeroed when the signer
/// is dropped.
pub struct Signer {
    key_id: Decoded<Hex>,
    pair: SignKeyPair,
    pkcs8: Zeroizing<Vec<u8>>,
}

impl Signer {
    /// The key ID this signer produces signatures for.
    pub fn key_id(&self) -> &Decoded<Hex> {
        &self.key_id
    }

    /// The bare algorithm of the underlying keypair.
    pub fn algorithm(&self) -> KeyAlgorithm {
        self.pair.algorithm()
    }

    /// The TUF key entry for the bare public key.
    pub fn tuf_key(&self) -> Key {
        self.pair.tuf_key()
    }

    pub(crate) fn pkcs8_der(&self) -> &[u8] {
        &self.pkcs8
    }

    pub(crate) fn sign(&self, msg: &[u8]) -> Result<Vec<u8>> {
        let rng = SystemRandom::new();
        self.pair.sign(msg, &rng)
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// A lone signer can serve as the crypto service for a role whose key list
/// names it. It cannot mint keys.
impl CryptoService for Signer {
    fn create(&self, role: RoleType, _algorithm: KeyAlgorithm) -> Result<Key> {
        error::SigningKeysNotFoundSnafu { role }.fail()
    }

    fn sign(
        &self,
        role: RoleType,
        keyids: &[Decoded<Hex>],
        payload: &[u8],
    ) -> Result<Vec<Signature>> {
        ensure!(
            keyids.contains(&self.key_id),
            error::SigningKeysNotFoundSnafu { role }
        );
        let sig = self.sign(payload)?;
        Ok(vec![Signature {
            keyid: self.key_id.clone(),
            sig: sig.into(),
        }])
    }
}

/// The encrypted private-key store for a collection, rooted at
/// `<baseDir>/private_keys/`.
#[derive(Debug)]
pub struct KeyCustody {
    dir: PathBuf,
    passphrase: Box<dyn PassphraseSource>,
}

impl KeyCustody {
    /// Opens key custody over a directory. The directory is created lazily on
    /// the first write.
    pub fn open<P: AsRef<Path>>(dir: P, passphrase: Box<dyn PassphraseSource>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            passphrase,
        }
    }

    fn key_path(&self, keyid: &str) -> PathBuf {
        self.dir.join(format!("{}.pem", keyid))
    }

    /// Stores a PKCS#8 private key encrypted under `passphrase` as
    /// `<keyid>.pem`. Adding the same key again under the same ID and
    /// passphrase is a no-op.
    pub fn add_encrypted(&self, keyid: &str, pkcs8_der: &[u8], passphrase: &str) -> Result<()> {
        let path = self.key_path(keyid);
        if path.exists() {
            if let Ok(existing) = self.decrypt_file(&path, keyid, passphrase) {
                if existing.as_slice() == pkcs8_der {
                    return Ok(());
                }
            }
        }

        let encrypted = sign::encrypt_key(pkcs8_der, passphrase, keyid)?;
        let pem = pem::encode(&pem::Pem::new("ENCRYPTED PRIVATE KEY", encrypted));

        std::fs::create_dir_all(&self.dir).context(error::DirCreateSnafu { path: &self.dir })?;
        crate::store::write_atomic(&path, pem.as_bytes())?;
        debug!("stored encrypted key {}", keyid);
        Ok(())
    }

    /// Decrypts the key stored for `keyid` (following trust links) and
    /// returns a signing capability for it. The signer reports `keyid`
    /// itself, so signatures made through an alias carry the alias ID.
    pub fn get_decrypted(&self, keyid: &str, passphrase: &str) -> Result<Signer> {
        let path = self.key_path(keyid);
        ensure!(path.exists(), error::KeyNotFoundSnafu { keyid });

        let der = self.decrypt_file(&path, keyid, passphrase)?;
        let pair = sign::parse_keypair(&der)?;
        Ok(Signer {
            key_id: Decoded::from_encoded(keyid)?,
            pair,
            pkcs8: der,
        })
    }

    fn decrypt_file(&self, path: &Path, keyid: &str, passphrase: &str) -> Result<Zeroizing<Vec<u8>>> {
        let data = std::fs::read(path).context(error::FileReadSnafu { path })?;
        let pem = pem::parse(&data).map_err(|err| {
            error::KeyPkcs8Snafu {
                keyid,
                reason: err.to_string(),
            }
            .build()
        })?;
        match pem.tag() {
            "ENCRYPTED PRIVATE KEY" => sign::decrypt_key(pem.contents(), passphrase, keyid),
            // Unencrypted keys are accepted for reading but never written.
            "PRIVATE KEY" => Ok(Zeroizing::new(pem.contents().to_vec())),
            _ => error::KeyUnrecognizedSnafu.fail(),
        }
    }

    /// Records a durable alias so `external` (a certificate fingerprint or a
    /// derived key ID) resolves to the private key stored for `internal`.
    /// Re-linking the same pair is a no-op.
    pub fn link(&self, external: &str, internal: &str) -> Result<()> {
        let link_path = self.key_path(external);
        let target = PathBuf::from(format!("{}.pem", internal));
        if let Ok(existing) = std::fs::read_link(&link_path) {
            if existing == target {
                return Ok(());
            }
            std::fs::remove_file(&link_path).context(error::FileWriteSnafu { path: &link_path })?;
        }
        std::fs::create_dir_all(&self.dir).context(error::DirCreateSnafu { path: &self.dir })?;
        symlink(&target, &link_path).context(error::FileWriteSnafu { path: &link_path })?;
        debug!("linked key {} -> {}", external, internal);
        Ok(())
    }

    /// Generates a keypair for `role`, stores it encrypted under the
    /// role-appropriate passphrase, and returns a signing capability whose
    /// ID is the new key's TUF key ID.
    pub fn create_signer(&self, role: RoleType, algorithm: KeyAlgorithm) -> Result<Signer> {
        let (pair, der) = sign::generate_keypair(algorithm)?;
        let key = pair.tuf_key();
        let keyid = key.key_id()?;
        let passphrase = self.passphrase.passphrase(role)?;
        self.add_encrypted(&keyid.to_string(), &der, &passphrase)?;
        debug!("generated {} key {} for role {}", algorithm, keyid, role);
        Ok(Signer {
            key_id: keyid,
            pair,
            pkcs8: der,
        })
    }

    pub(crate) fn passphrase_for(&self, role: RoleType) -> Result<Zeroizing<String>> {
        self.passphrase.passphrase(role)
    }
}

impl CryptoService for KeyCustody {
    fn create(&self, role: RoleType, algorithm: KeyAlgorithm) -> Result<Key> {
        Ok(self.create_signer(role, algorithm)?.tuf_key())
    }

    fn sign(
        &self,
        role: RoleType,
        keyids: &[Decoded<Hex>],
        payload: &[u8],
    ) -> Result<Vec<Signature>> {
        let mut signatures = Vec::new();
        for keyid in keyids {
            let keyid_hex = keyid.to_string();
            if !self.key_path(&keyid_hex).exists() {
                continue;
            }
            let passphrase = self.passphrase.passphrase(role)?;
            let signer = self.get_decrypted(&keyid_hex, &passphrase)?;
            let sig = signer.sign(payload)?;
            signatures.push(Signature {
                keyid: keyid.clone(),
                sig: sig.into(),
            });
        }
        ensure!(
            !signatures.is_empty(),
            error::SigningKeysNotFoundSnafu { role }
        );
        Ok(signatures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn custody(dir: &Path) -> KeyCustody {
        KeyCustody::open(dir, Box::new(StaticPassphrase::new("hunter2")))
    }

    #[test]
    fn store_and_decrypt() {
        let tmp = tempfile::tempdir().unwrap();
        let custody = custody(&tmp.path().join("private_keys"));

        let signer = custody.create_signer(RoleType::Targets, KeyAlgorithm::Ecdsa).unwrap();
        let keyid = signer.key_id().to_string();

        let reloaded = custody.get_decrypted(&keyid, "hunter2").unwrap();
        assert_eq!(reloaded.key_id(), signer.key_id());
        assert_eq!(reloaded.tuf_key(), signer.tuf_key());
    }

    #[test]
    fn wrong_passphrase() {
        let tmp = tempfile::tempdir().unwrap();
        let custody = custody(tmp.path());
        let signer = custody.create_signer(RoleType::Targets, KeyAlgorithm::Ecdsa).unwrap();
        assert!(matches!(
            custody.get_decrypted(&signer.key_id().to_string(), "wrong"),
            Err(crate::error::Error::WrongPassphrase { .. })
        ));
    }

    #[test]
    fn missing_key() {
        let tmp = tempfile::tempdir().unwrap();
        let custody = custody(tmp.path());
        assert!(matches!(
            custody.get_decrypted("feedface", "hunter2"),
            Err(crate::error::Error::KeyNotFound { .. })
        ));
    }

    #[test]
    fn add_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let custody = custody(tmp.path());
        let (_, der) = sign::generate_keypair(KeyAlgorithm::Ecdsa).unwrap();
        custody.add_encrypted("abc123", &der, "hunter2").unwrap();
        custody.add_encrypted("abc123", &der, "hunter2").unwrap();
        custody.get_decrypted("abc123", "hunter2").unwrap();
    }

    #[test]
    fn link_resolves_to_backing_key() {
        let tmp = tempfile::tempdir().unwrap();
        let custody = custody(tmp.path());
        let signer = custody.create_signer(RoleType::Root, KeyAlgorithm::Ecdsa).unwrap();
        let internal = signer.key_id().to_string();

        custody.link("00112233", &internal).unwrap();
        custody.link("00112233", &internal).unwrap(); // idempotent

        // The alias decrypts to the same key but reports the alias ID.
        let via_alias = custody.get_decrypted("00112233", "hunter2").unwrap();
        assert_eq!(via_alias.tuf_key(), signer.tuf_key());
        assert_eq!(via_alias.key_id().to_string(), "00112233");
    }
}
