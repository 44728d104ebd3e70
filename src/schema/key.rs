// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provides the TUF public key schema: the `Key` enum covering the four key
//! types a collection uses, deterministic key IDs, and signature
//! verification.

use crate::error::{self, Result};
use crate::schema::decoded::{Base64, Decoded, Hex};
use aws_lc_rs::digest::{digest, SHA256};
use aws_lc_rs::signature::{UnparsedPublicKey, ECDSA_P256_SHA256_ASN1, RSA_PSS_2048_8192_SHA256};
use olpc_cjson::CanonicalFormatter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_plain::{forward_display_to_serde, forward_from_str_to_serde};
use snafu::ResultExt;
use std::collections::HashMap;
use x509_parser::prelude::FromDer;

/// The algorithm of a public key.
///
/// The `-x509` variants carry a PEM-encoded X.509 certificate as the public
/// material rather than a bare key, preserving the certificate envelope for
/// downstream verifiers.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum KeyAlgorithm {
    /// A bare RSA public key.
    #[serde(rename = "rsa")]
    Rsa,
    /// A bare ECDSA public key (NIST P-256).
    #[serde(rename = "ecdsa")]
    Ecdsa,
    /// An RSA public key wrapped in an X.509 certificate.
    #[serde(rename = "rsa-x509")]
    RsaX509,
    /// An ECDSA public key wrapped in an X.509 certificate.
    #[serde(rename = "ecdsa-x509")]
    EcdsaX509,
}

forward_display_to_serde!(KeyAlgorithm);
forward_from_str_to_serde!(KeyAlgorithm);

/// A public key in a role's key list.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "keytype")]
pub enum Key {
    /// A bare RSA public key, verified as RSASSA-PSS-SHA256.
    #[serde(rename = "rsa")]
    Rsa {
        /// The public key material.
        keyval: KeyVal,
        /// Extra arguments found during deserialization.
        ///
        /// We must store these to correctly verify signatures for this object.
        ///
        /// If you're instantiating this struct, you should make this
        /// `HashMap::new()`.
        #[serde(flatten)]
        _extra: HashMap<String, Value>,
    },
    /// A bare ECDSA public key on P-256, verified as ECDSA-SHA2-256.
    #[serde(rename = "ecdsa")]
    Ecdsa {
        /// The public key material.
        keyval: KeyVal,
        /// Extra arguments found during deserialization.
        #[serde(flatten)]
        _extra: HashMap<String, Value>,
    },
    /// An RSA public key carried as a PEM-encoded X.509 certificate.
    #[serde(rename = "rsa-x509")]
    RsaX509 {
        /// The PEM-encoded certificate.
        keyval: KeyVal,
        /// Extra arguments found during deserialization.
        #[serde(flatten)]
        _extra: HashMap<String, Value>,
    },
    /// An ECDSA public key carried as a PEM-encoded X.509 certificate.
    #[serde(rename = "ecdsa-x509")]
    EcdsaX509 {
        /// The PEM-encoded certificate.
        keyval: KeyVal,
        /// Extra arguments found during deserialization.
        #[serde(flatten)]
        _extra: HashMap<String, Value>,
    },
}

/// The public material of a `Key`, base64-encoded on the wire.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct KeyVal {
    /// The public key bytes. For the X.509 key types this is the PEM text of
    /// the certificate.
    pub public: Decoded<Base64>,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

impl KeyVal {
    /// Creates a `KeyVal` over public key bytes.
    pub fn new(public: Vec<u8>) -> Self {
        Self {
            public: public.into(),
            _extra: HashMap::new(),
        }
    }
}

impl Key {
    /// Creates a key entry of the given algorithm over public bytes.
    pub fn new(algorithm: KeyAlgorithm, public: Vec<u8>) -> Self {
        let keyval = KeyVal::new(public);
        match algorithm {
            KeyAlgorithm::Rsa => Key::Rsa {
                keyval,
                _extra: HashMap::new(),
            },
            KeyAlgorithm::Ecdsa => Key::Ecdsa {
                keyval,
                _extra: HashMap::new(),
            },
            KeyAlgorithm::RsaX509 => Key::RsaX509 {
                keyval,
                _extra: HashMap::new(),
            },
            KeyAlgorithm::EcdsaX509 => Key::EcdsaX509 {
                keyval,
                _extra: HashMap::new(),
            },
        }
    }

    /// The algorithm tag of this key.
    pub fn algorithm(&self) -> KeyAlgorithm {
        match self {
            Key::Rsa { .. } => KeyAlgorithm::Rsa,
            Key::Ecdsa { .. } => KeyAlgorithm::Ecdsa,
            Key::RsaX509 { .. } => KeyAlgorithm::RsaX509,
            Key::EcdsaX509 { .. } => KeyAlgorithm::EcdsaX509,
        }
    }

    /// The public key material.
    pub fn keyval(&self) -> &KeyVal {
        match self {
            Key::Rsa { keyval, .. }
            | Key::Ecdsa { keyval, .. }
            | Key::RsaX509 { keyval, .. }
            | Key::EcdsaX509 { keyval, .. } => keyval,
        }
    }

    /// Calculates the key ID of this key: the SHA-256 digest of the key's
    /// canonical JSON form. The ID is deterministic over the algorithm and
    /// public bytes.
    pub fn key_id(&self) -> Result<Decoded<Hex>> {
        let mut buf = Vec::new();
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, CanonicalFormatter::new());
        self.serialize(&mut ser).context(error::EncodeSnafu {
            what: "public key".to_string(),
        })?;
        Ok(digest(&SHA256, &buf).as_ref().to_vec().into())
    }

    /// Verifies `sig` over `msg` with this key. Returns `false` for invalid
    /// signatures and for key material that cannot be interpreted.
    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> bool {
        let public = match self.verifying_bytes() {
            Some(bytes) => bytes,
            None => return false,
        };
        match self {
            Key::Rsa { .. } | Key::RsaX509 { .. } => {
                UnparsedPublicKey::new(&RSA_PSS_2048_8192_SHA256, &public)
                    .verify(msg, sig)
                    .is_ok()
            }
            Key::Ecdsa { .. } | Key::EcdsaX509 { .. } => {
                UnparsedPublicKey::new(&ECDSA_P256_SHA256_ASN1, &public)
                    .verify(msg, sig)
                    .is_ok()
            }
        }
    }

    /// Extracts the raw bytes the verifier needs: for the X.509 key types the
    /// certificate's subject public key, for the bare types the key material
    /// itself (unwrapping a SubjectPublicKeyInfo envelope if one is present).
    fn verifying_bytes(&self) -> Option<Vec<u8>> {
        let public = self.keyval().public.as_ref();
        match self {
            Key::RsaX509 { .. } | Key::EcdsaX509 { .. } => {
                let pem = x509_parser::pem::parse_x509_pem(public).ok()?.1;
                let cert = pem.parse_x509().ok()?;
                Some(cert.public_key().subject_public_key.data.to_vec())
            }
            Key::Rsa { .. } | Key::Ecdsa { .. } => {
                match x509_parser::x509::SubjectPublicKeyInfo::from_der(public) {
                    Ok((_, spki)) => Some(spki.subject_public_key.data.to_vec()),
                    Err(_) => Some(public.to_vec()),
                }
            }
        }
    }

    /// For the X.509 key types, the PEM text of the certificate.
    pub fn public_pem(&self) -> Option<&str> {
        match self {
            Key::RsaX509 { .. } | Key::EcdsaX509 { .. } => {
                std::str::from_utf8(self.keyval().public.as_ref()).ok()
            }
            _ => None,
        }
    }
}
