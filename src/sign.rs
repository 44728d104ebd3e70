// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provides the `Sign` trait which abstracts over the method of signing with
//! different key types, plus keypair generation and the PKCS#8
//! encrypt/decrypt helpers used by key custody.

use crate::error::{self, Result};
use crate::schema::key::{Key, KeyAlgorithm, KeyVal};
use aws_lc_rs::encoding::AsDer;
use aws_lc_rs::rand::{SecureRandom, SystemRandom};
use aws_lc_rs::rsa::KeySize;
use aws_lc_rs::signature::{
    EcdsaKeyPair, KeyPair as _, RsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING, RSA_PSS_SHA256,
};
use pkcs8::der::Decode;
use snafu::ResultExt;
use std::collections::HashMap;
use std::fmt::Debug;
use zeroize::Zeroizing;

/// This trait must be implemented for each type of key with which you will
/// sign things.
pub trait Sign: Debug + Send + Sync {
    /// Returns the decoded key along with its scheme and other metadata.
    fn tuf_key(&self) -> Key;

    /// Signs the supplied message.
    fn sign(&self, msg: &[u8], rng: &dyn SecureRandom) -> Result<Vec<u8>>;
}

/// Implements the Sign trait for RSA keypairs (RSASSA-PSS-SHA256).
impl Sign for RsaKeyPair {
    fn tuf_key(&self) -> Key {
        Key::Rsa {
            keyval: KeyVal::new(self.public_key().as_ref().to_vec()),
            _extra: HashMap::new(),
        }
    }

    fn sign(&self, msg: &[u8], rng: &dyn SecureRandom) -> Result<Vec<u8>> {
        let mut signature = vec![0; self.public_modulus_len()];
        self.sign(&RSA_PSS_SHA256, rng, msg, &mut signature)
            .context(error::SignSnafu)?;
        Ok(signature)
    }
}

/// Implements the Sign trait for ECDSA keypairs (P-256, SHA-256).
impl Sign for EcdsaKeyPair {
    fn tuf_key(&self) -> Key {
        Key::Ecdsa {
            keyval: KeyVal::new(self.public_key().as_ref().to_vec()),
            _extra: HashMap::new(),
        }
    }

    fn sign(&self, msg: &[u8], rng: &dyn SecureRandom) -> Result<Vec<u8>> {
        let signature = self.sign(rng, msg).context(error::SignSnafu)?;
        Ok(signature.as_ref().to_vec())
    }
}

/// Keypair used for signing metadata.
#[derive(Debug)]
pub enum SignKeyPair {
    /// RSA key pair.
    Rsa(RsaKeyPair),
    /// ECDSA key pair.
    Ecdsa(EcdsaKeyPair),
}

impl SignKeyPair {
    /// The bare algorithm of this keypair.
    pub fn algorithm(&self) -> KeyAlgorithm {
        match self {
            SignKeyPair::Rsa(_) => KeyAlgorithm::Rsa,
            SignKeyPair::Ecdsa(_) => KeyAlgorithm::Ecdsa,
        }
    }
}

impl Sign for SignKeyPair {
    fn tuf_key(&self) -> Key {
        match self {
            SignKeyPair::Rsa(key) => key.tuf_key(),
            SignKeyPair::Ecdsa(key) => key.tuf_key(),
        }
    }

    fn sign(&self, msg: &[u8], rng: &dyn SecureRandom) -> Result<Vec<u8>> {
        match self {
            SignKeyPair::Rsa(key) => (key as &dyn Sign).sign(msg, rng),
            SignKeyPair::Ecdsa(key) => (key as &dyn Sign).sign(msg, rng),
        }
    }
}

/// Generates a fresh keypair of the given bare algorithm (RSA-4096 or ECDSA
/// P-256), returning the parsed pair and its PKCS#8 v1 DER form.
pub fn generate_keypair(algorithm: KeyAlgorithm) -> Result<(SignKeyPair, Zeroizing<Vec<u8>>)> {
    match algorithm {
        KeyAlgorithm::Rsa => {
            let pair = RsaKeyPair::generate(KeySize::Rsa4096).map_err(|_| {
                error::KeyGenerateSnafu {
                    algorithm: algorithm.to_string(),
                }
                .build()
            })?;
            let der = Zeroizing::new(
                pair.as_der()
                    .map_err(|_| {
                        error::KeyGenerateSnafu {
                            algorithm: algorithm.to_string(),
                        }
                        .build()
                    })?
                    .as_ref()
                    .to_vec(),
            );
            Ok((SignKeyPair::Rsa(pair), der))
        }
        KeyAlgorithm::Ecdsa => {
            let rng = SystemRandom::new();
            let document = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng)
                .map_err(|_| {
                    error::KeyGenerateSnafu {
                        algorithm: algorithm.to_string(),
                    }
                    .build()
                })?;
            let der = Zeroizing::new(document.as_ref().to_vec());
            let pair = parse_keypair(&der)?;
            Ok((pair, der))
        }
        KeyAlgorithm::RsaX509 | KeyAlgorithm::EcdsaX509 => error::InvalidKeyAlgorithmSnafu {
            algorithm: algorithm.to_string(),
        }
        .fail(),
    }
}

/// Parses a PKCS#8 v1 DER keypair and, if it is recognized, returns an
/// object that implements the Sign trait. Accepted keys: ECDSA P-256, RSA.
pub fn parse_keypair(der: &[u8]) -> Result<SignKeyPair> {
    if let Ok(pair) = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, der) {
        Ok(SignKeyPair::Ecdsa(pair))
    } else if let Ok(pair) = RsaKeyPair::from_pkcs8(der) {
        Ok(SignKeyPair::Rsa(pair))
    } else {
        error::KeyUnrecognizedSnafu.fail()
    }
}

/// Encrypts a PKCS#8 v1 DER private key under the given passphrase,
/// returning the DER form of the `EncryptedPrivateKeyInfo`
/// (PBKDF2-SHA256 + AES-256-CBC).
pub fn encrypt_key(der: &[u8], passphrase: &str, keyid: &str) -> Result<Vec<u8>> {
    let rng = SystemRandom::new();
    let mut salt = [0u8; 16];
    rng.fill(&mut salt).context(error::SystemRandomSnafu)?;
    let mut iv = [0u8; 16];
    rng.fill(&mut iv).context(error::SystemRandomSnafu)?;

    let params = pkcs8::pkcs5::pbes2::Parameters::pbkdf2_sha256_aes256cbc(100_000, &salt, &iv)
        .map_err(|err| pkcs8_error(keyid, &err))?;
    let document = pkcs8::PrivateKeyInfo::from_der(der)
        .map_err(|err| pkcs8_error(keyid, &err))?
        .encrypt_with_params(params, passphrase.as_bytes())
        .map_err(|err| pkcs8_error(keyid, &err))?;
    Ok(document.as_bytes().to_vec())
}

/// Decrypts the DER form of an `EncryptedPrivateKeyInfo` using the given
/// passphrase. Returns the decrypted key in PKCS#8 v1 DER form. A
/// decryption failure is reported as a wrong passphrase.
pub fn decrypt_key(der: &[u8], passphrase: &str, keyid: &str) -> Result<Zeroizing<Vec<u8>>> {
    let encrypted = pkcs8::EncryptedPrivateKeyInfo::from_der(der)
        .map_err(|err| pkcs8_error(keyid, &err))?;
    let decrypted = encrypted.decrypt(passphrase.as_bytes()).map_err(|_| {
        error::WrongPassphraseSnafu {
            keyid: keyid.to_string(),
        }
        .build()
    })?;
    Ok(Zeroizing::new(decrypted.as_bytes().to_vec()))
}

fn pkcs8_error(keyid: &str, err: &dyn std::fmt::Display) -> crate::error::Error {
    error::KeyPkcs8Snafu {
        keyid: keyid.to_string(),
        reason: err.to_string(),
    }
    .build()
}
