// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provides the `TrustStore`: two filtered X.509 stores (CA anchors and leaf
//! certificates) loaded from the collection's `trusted_certificates/`
//! directory, plus the helpers for minting and fingerprinting root
//! certificates.

use crate::error::{self, Result};
use crate::io::sha256;
use crate::schema::key::KeyAlgorithm;
use chrono::{Datelike, Duration, Utc};
use log::{debug, warn};
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::ParsedExtension;
use x509_parser::oid_registry::asn1_rs::oid;
use x509_parser::oid_registry::{Oid, OID_PKCS1_SHA1WITHRSA, OID_SIG_DSA_WITH_SHA1};
use x509_parser::prelude::FromDer;

/// `ecdsa-with-SHA1` (1.2.840.10045.4.1); not present in the `oid-registry` crate's database.
const OID_SIG_ECDSA_WITH_SHA1: Oid<'static> = oid!(1.2.840.10045.4.1);

/// How long a freshly minted root certificate stays valid.
const ROOT_CERT_VALID_DAYS: i64 = 10 * 365;

/// A certificate held by the trust store.
#[derive(Debug, Clone)]
pub struct CertEntry {
    /// hex(SHA-256) of the certificate's DER bytes.
    pub fingerprint: String,
    /// The DER bytes themselves; parsed on demand.
    pub der: Vec<u8>,
    /// The subject common name.
    pub common_name: String,
}

/// Two independent filtered stores over the same directory: CA anchors and
/// leaf certificates. Certificates that fail the filters (expired, SHA-1
/// signed, malformed) are ignored with a warning, not errors.
#[derive(Debug)]
pub struct TrustStore {
    dir: PathBuf,
    cas: HashMap<String, CertEntry>,
    leaves: HashMap<String, CertEntry>,
}

impl TrustStore {
    /// Loads the trust store from a directory of PEM files, one certificate
    /// per file. A missing directory yields an empty store; it is created on
    /// the first `add`.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let mut store = Self {
            dir,
            cas: HashMap::new(),
            leaves: HashMap::new(),
        };
        if !store.dir.is_dir() {
            return Ok(store);
        }

        for entry in WalkDir::new(&store.dir).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("skipping unreadable trust store entry: {}", err);
                    continue;
                }
            };
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "pem") {
                continue;
            }
            let data = std::fs::read(path).context(error::FileReadSnafu { path })?;
            for pem in x509_parser::pem::Pem::iter_from_buffer(&data) {
                let pem = match pem {
                    Ok(pem) if pem.label == "CERTIFICATE" => pem,
                    Ok(_) => continue,
                    Err(err) => {
                        warn!("skipping malformed PEM in {}: {}", path.display(), err);
                        continue;
                    }
                };
                store.insert_der(&pem.contents, path);
            }
        }
        Ok(store)
    }

    /// Routes a DER certificate into whichever filtered store accepts it.
    fn insert_der(&mut self, der: &[u8], origin: &Path) {
        let cert = match X509Certificate::from_der(der) {
            Ok((_, cert)) => cert,
            Err(err) => {
                warn!(
                    "skipping unparseable certificate in {}: {}",
                    origin.display(),
                    err
                );
                return;
            }
        };
        let entry = CertEntry {
            fingerprint: fingerprint(der),
            der: der.to_vec(),
            common_name: common_name(&cert).unwrap_or_default(),
        };
        if ca_filter(&cert) {
            debug!("trusted CA {} ({})", entry.fingerprint, entry.common_name);
            self.cas.insert(entry.fingerprint.clone(), entry);
        } else if leaf_filter(&cert) {
            debug!("trusted leaf {} ({})", entry.fingerprint, entry.common_name);
            self.leaves.insert(entry.fingerprint.clone(), entry);
        } else {
            debug!(
                "certificate in {} passes neither trust filter, ignoring",
                origin.display()
            );
        }
    }

    /// Returns the leaf certificate with the given fingerprint.
    pub fn get_by_fingerprint(&self, fingerprint: &str) -> Result<&CertEntry> {
        self.leaves
            .get(fingerprint)
            .context(error::CertNotFoundSnafu { fingerprint })
    }

    /// Fingerprints of all leaf certificates currently trusted.
    pub fn fingerprints(&self) -> impl Iterator<Item = &str> {
        self.leaves.keys().map(String::as_str)
    }

    /// Verifies that `leaf_der` chains to one of the CA anchors (issuer name
    /// match plus signature check) and that its common name equals `gun`.
    pub fn verify(&self, leaf_der: &[u8], gun: &str) -> Result<()> {
        let (_, leaf) = X509Certificate::from_der(leaf_der).map_err(|err| {
            error::CertificateParseSnafu {
                path: PathBuf::from("<chain>"),
                reason: err.to_string(),
            }
            .build()
        })?;

        let cn = common_name(&leaf).unwrap_or_default();
        ensure!(
            cn == gun,
            error::CertificateVerifySnafu {
                gun,
                reason: format!("leaf common name '{}' does not match", cn),
            }
        );

        for ca_entry in self.cas.values() {
            let (_, ca) = match X509Certificate::from_der(&ca_entry.der) {
                Ok(parsed) => parsed,
                Err(_) => continue,
            };
            if leaf.issuer().as_raw() != ca.subject().as_raw() {
                continue;
            }
            if leaf.verify_signature(Some(ca.public_key())).is_ok() {
                return Ok(());
            }
        }
        error::CertificateVerifySnafu {
            gun,
            reason: "no CA anchor signs the leaf".to_string(),
        }
        .fail()
    }

    /// Installs a PEM certificate into the store directory as
    /// `<fingerprint>.pem` (atomic write) and into the in-memory filtered
    /// stores. Returns the fingerprint.
    pub fn add(&mut self, cert_pem: &str) -> Result<String> {
        let pem = pem::parse(cert_pem).map_err(|err| {
            error::CertificateParseSnafu {
                path: self.dir.clone(),
                reason: err.to_string(),
            }
            .build()
        })?;
        let fingerprint = fingerprint(pem.contents());

        std::fs::create_dir_all(&self.dir).context(error::DirCreateSnafu { path: &self.dir })?;
        let path = self.dir.join(format!("{}.pem", fingerprint));
        crate::store::write_atomic(&path, cert_pem.as_bytes())?;

        self.insert_der(pem.contents(), &path);
        Ok(fingerprint)
    }
}

/// CA anchor filter: a CA with valid basic constraints and a subject key ID,
/// unexpired, not signed with SHA-1.
fn ca_filter(cert: &X509Certificate<'_>) -> bool {
    let (is_ca, bc_valid) = basic_constraints(cert);
    is_ca && bc_valid && has_subject_key_id(cert) && unexpired(cert) && !sha1_signed(cert)
}

/// Leaf filter: not a CA, unexpired, not signed with SHA-1.
fn leaf_filter(cert: &X509Certificate<'_>) -> bool {
    let (is_ca, _) = basic_constraints(cert);
    !is_ca && unexpired(cert) && !sha1_signed(cert)
}

fn basic_constraints(cert: &X509Certificate<'_>) -> (bool, bool) {
    for ext in cert.extensions() {
        if let ParsedExtension::BasicConstraints(bc) = ext.parsed_extension() {
            return (bc.ca, true);
        }
    }
    (false, false)
}

fn has_subject_key_id(cert: &X509Certificate<'_>) -> bool {
    cert.extensions()
        .iter()
        .any(|ext| matches!(ext.parsed_extension(), ParsedExtension::SubjectKeyIdentifier(_)))
}

fn unexpired(cert: &X509Certificate<'_>) -> bool {
    cert.validity().not_after.timestamp() > Utc::now().timestamp()
}

fn sha1_signed(cert: &X509Certificate<'_>) -> bool {
    let oid = &cert.signature_algorithm.algorithm;
    *oid == OID_PKCS1_SHA1WITHRSA || *oid == OID_SIG_DSA_WITH_SHA1 || *oid == OID_SIG_ECDSA_WITH_SHA1
}

fn common_name(cert: &X509Certificate<'_>) -> Option<String> {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
}

/// Mints a self-signed X.509 certificate over the given private key with
/// subject CN = `gun`. The key must be the PKCS#8 v1 DER of an RSA or ECDSA
/// P-256 key; the signature algorithm follows it.
pub(crate) fn mint_certificate(
    pkcs8_der: &[u8],
    algorithm: KeyAlgorithm,
    gun: &str,
) -> Result<String> {
    let alg = match algorithm {
        KeyAlgorithm::Rsa => &rcgen::PKCS_RSA_SHA256,
        KeyAlgorithm::Ecdsa => &rcgen::PKCS_ECDSA_P256_SHA256,
        KeyAlgorithm::RsaX509 | KeyAlgorithm::EcdsaX509 => {
            return error::InvalidKeyAlgorithmSnafu {
                algorithm: algorithm.to_string(),
            }
            .fail()
        }
    };

    let key_pair = rcgen::KeyPair::try_from(pkcs8_der).context(error::CertificateGenerateSnafu { gun })?;

    let mut params = rcgen::CertificateParams::new(Vec::new());
    params.alg = alg;
    params.key_pair = Some(key_pair);
    params.is_ca = rcgen::IsCa::ExplicitNoCa;
    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, gun);
    params.distinguished_name = dn;

    let now = Utc::now();
    let until = now + Duration::days(ROOT_CERT_VALID_DAYS);
    params.not_before = rcgen::date_time_ymd(now.year(), now.month() as u8, now.day() as u8);
    params.not_after = rcgen::date_time_ymd(until.year(), until.month() as u8, until.day() as u8);

    let cert = rcgen::Certificate::from_params(params)
        .context(error::CertificateGenerateSnafu { gun })?;
    cert.serialize_pem()
        .context(error::CertificateGenerateSnafu { gun })
}

/// hex(SHA-256) over a certificate's DER bytes.
pub(crate) fn fingerprint(der: &[u8]) -> String {
    hex::encode(sha256(der))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::key::KeyAlgorithm;
    use crate::sign::generate_keypair;

    fn mint(gun: &str) -> String {
        let (_, der) = generate_keypair(KeyAlgorithm::Ecdsa).unwrap();
        mint_certificate(&der, KeyAlgorithm::Ecdsa, gun).unwrap()
    }

    #[test]
    fn add_and_fetch_leaf() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = TrustStore::open(tmp.path().join("trusted_certificates")).unwrap();
        let pem = mint("docker.io/library/app");
        let fingerprint = store.add(&pem).unwrap();

        let entry = store.get_by_fingerprint(&fingerprint).unwrap();
        assert_eq!(entry.common_name, "docker.io/library/app");
        assert!(tmp
            .path()
            .join("trusted_certificates")
            .join(format!("{}.pem", fingerprint))
            .is_file());

        // A fresh scan of the directory finds the same certificate.
        let reopened = TrustStore::open(tmp.path().join("trusted_certificates")).unwrap();
        assert!(reopened.get_by_fingerprint(&fingerprint).is_ok());
    }

    #[test]
    fn missing_fingerprint_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TrustStore::open(tmp.path()).unwrap();
        assert!(matches!(
            store.get_by_fingerprint("00ff"),
            Err(crate::error::Error::CertNotFound { .. })
        ));
    }

    #[test]
    fn self_signed_leaf_is_not_a_ca() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = TrustStore::open(tmp.path()).unwrap();
        let fingerprint = store.add(&mint("gun")).unwrap();
        // It must land in the leaf store, not the CA store.
        assert!(store.leaves.contains_key(&fingerprint));
        assert!(store.cas.is_empty());
    }

    #[test]
    fn verify_fails_without_anchor() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TrustStore::open(tmp.path()).unwrap();
        let pem = pem::parse(mint("gun")).unwrap();
        assert!(store.verify(pem.contents(), "gun").is_err());
    }

    #[test]
    fn verify_checks_common_name_first() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TrustStore::open(tmp.path()).unwrap();
        let pem = pem::parse(mint("some/other/gun")).unwrap();
        let err = store.verify(pem.contents(), "this/gun").unwrap_err();
        assert!(err.to_string().contains("common name"));
    }
}
