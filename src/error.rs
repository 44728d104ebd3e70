// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Contains the error type for this library.

#![allow(clippy::default_trait_access)]

use crate::schema::RoleType;
use chrono::{DateTime, Utc};
use snafu::{Backtrace, Snafu};
use std::path::PathBuf;

/// Alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for this library.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum Error {
    /// A certificate in the trust store directory could not be parsed.
    #[snafu(display("Failed to parse certificate '{}': {}", path.display(), reason))]
    CertificateParse {
        path: PathBuf,
        reason: String,
        backtrace: Backtrace,
    },

    /// Minting the self-signed root certificate failed.
    #[snafu(display("Failed to generate certificate for '{}': {}", gun, source))]
    CertificateGenerate {
        gun: String,
        source: rcgen::RcgenError,
        backtrace: Backtrace,
    },

    /// A certificate chain did not terminate in a trusted CA, or the leaf
    /// common name did not match the collection.
    #[snafu(display("Certificate chain for '{}' does not verify: {}", gun, reason))]
    CertificateVerify {
        gun: String,
        reason: String,
        backtrace: Backtrace,
    },

    /// No certificate with the requested fingerprint is in the trust store.
    #[snafu(display("No trusted certificate with fingerprint {}", fingerprint))]
    CertNotFound {
        fingerprint: String,
        backtrace: Backtrace,
    },

    /// A changelist entry could not be parsed or ordered.
    #[snafu(display("Changelist entry '{}' is corrupt: {}", path.display(), reason))]
    ChangelistCorrupt {
        path: PathBuf,
        reason: String,
        backtrace: Backtrace,
    },

    /// A changelist entry names a role or action the publish pipeline does
    /// not understand.
    #[snafu(display("Unknown change (role '{}', action '{}') in changelist", scope, action))]
    ChangeUnknown {
        scope: String,
        action: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to create directory '{}': {}", path.display(), source))]
    DirCreate {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// Hex or base64 text failed to decode.
    #[snafu(display("Failed to decode {} text: {}", encoding, reason))]
    Decode {
        encoding: &'static str,
        reason: String,
        backtrace: Backtrace,
    },

    /// A duplicate key ID was found while deserializing a key map.
    #[snafu(display("Duplicate key ID: {}", keyid))]
    DuplicateKeyId { keyid: String, backtrace: Backtrace },

    /// Serializing a role to canonical JSON failed.
    #[snafu(display("Failed to serialize {} to canonical JSON: {}", what, source))]
    Encode {
        what: String,
        source: serde_json::Error,
        backtrace: Backtrace,
    },

    /// Metadata was expired at the time it was checked.
    #[snafu(display("Role {} expired at {}", role, expires))]
    ExpiredMetadata {
        role: RoleType,
        expires: DateTime<Utc>,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to open {}: {}", path.display(), source))]
    FileOpen {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to copy {} to {}: {}", source.file.path().display(), path.display(), source.error))]
    FilePersist {
        path: PathBuf,
        source: tempfile::PersistError,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to read {}: {}", path.display(), source))]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to create temporary file in {}: {}", path.display(), source))]
    FileTempCreate {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to write to {}: {}", path.display(), source))]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// The digest of fetched metadata did not match the digest listed for it.
    #[snafu(display(
        "Hash mismatch for {}: calculated {}, expected {}",
        context,
        calculated,
        expected
    ))]
    HashMismatch {
        context: String,
        calculated: String,
        expected: String,
        backtrace: Backtrace,
    },

    /// A key algorithm outside the set this library supports for the
    /// requested role.
    #[snafu(display("Invalid key algorithm '{}' (root keys must be rsa or ecdsa)", algorithm))]
    InvalidKeyAlgorithm {
        algorithm: String,
        backtrace: Backtrace,
    },

    /// A key ID in a key map did not match the contents of its key.
    #[snafu(display("Invalid key ID {}: calculated {}", keyid, calculated))]
    InvalidKeyId {
        keyid: String,
        calculated: String,
        backtrace: Backtrace,
    },

    /// A target's hash set is unusable (missing or malformed sha256).
    #[snafu(display("Target '{}' is invalid: {}", name, reason))]
    InvalidTarget {
        name: String,
        reason: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to generate {} keypair", algorithm))]
    KeyGenerate {
        algorithm: String,
        backtrace: Backtrace,
    },

    /// No private key with the requested ID is held in key custody.
    #[snafu(display("No private key for key ID {}", keyid))]
    KeyNotFound { keyid: String, backtrace: Backtrace },

    /// Encrypting or decoding a PKCS#8 private-key blob failed.
    #[snafu(display("Failed to process private key {}: {}", keyid, reason))]
    KeyPkcs8 {
        keyid: String,
        reason: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Unrecognized or unsupported private key format"))]
    KeyUnrecognized { backtrace: Backtrace },

    /// The remote does not have metadata for the named role (the 404 case,
    /// used as control flow by the publish pipeline).
    #[snafu(display("Metadata for role '{}' not found", role))]
    MetaNotFound { role: String, backtrace: Backtrace },

    /// Downloaded data exceeded the size limit that applied to it.
    #[snafu(display("Downloaded data exceeds limit of {} bytes ({})", max_size, specifier))]
    MaxSizeExceeded {
        max_size: u64,
        specifier: &'static str,
        backtrace: Backtrace,
    },

    /// Reading from a capped stream failed.
    #[snafu(display("Failed to read stream ({}): {}", specifier, source))]
    ReadStream {
        specifier: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// Root validation produced an empty trusted key set for the collection.
    #[snafu(display("No trusted root keys for '{}'", gun))]
    NoTrustedRoot { gun: String, backtrace: Backtrace },

    /// The root metadata lists no keys for a role we need to use.
    #[snafu(display("Root metadata holds no keys for role '{}'", role))]
    NoRoleKeys { role: RoleType, backtrace: Backtrace },

    /// The engine has no document loaded for a role it needs.
    #[snafu(display("No {} role has been loaded", role))]
    RoleNotLoaded { role: RoleType, backtrace: Backtrace },

    #[snafu(display("Failed to parse {} metadata: {}", role, source))]
    ParseMetadata {
        role: RoleType,
        source: serde_json::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to parse URL '{}': {}", url, source))]
    ParseUrl {
        url: String,
        source: url::ParseError,
        backtrace: Backtrace,
    },

    /// Obtaining a passphrase from the caller-supplied source failed.
    #[snafu(display("No passphrase available for role '{}': {}", role, reason))]
    PassphraseUnavailable {
        role: RoleType,
        reason: String,
        backtrace: Backtrace,
    },

    /// Publish was called against a collection with neither remote nor local
    /// state.
    #[snafu(display("Collection '{}' has not been initialized", gun))]
    RepoNotInitialized { gun: String, backtrace: Backtrace },

    /// An operation was requested on a collection directory that does not
    /// exist.
    #[snafu(display("No collection at {}", path.display()))]
    RepoNotExist { path: PathBuf, backtrace: Backtrace },

    /// A remote request failed for a reason other than missing metadata.
    #[snafu(display("Remote unavailable for '{}': {}", url, reason))]
    RemoteUnavailable {
        url: String,
        reason: String,
        backtrace: Backtrace,
    },

    /// Root signature verification did not meet the required threshold.
    #[snafu(display(
        "Root validation failed for '{}': {} valid signature(s), threshold {}",
        gun,
        valid,
        threshold
    ))]
    RootValidationFailed {
        gun: String,
        valid: u64,
        threshold: u64,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to sign message: {}", source))]
    Sign {
        source: aws_lc_rs::error::Unspecified,
        backtrace: Backtrace,
    },

    /// Signature verification of a role did not meet its threshold.
    #[snafu(display(
        "Role {} has {} valid signature(s), threshold {}",
        role,
        valid,
        threshold
    ))]
    SignatureThreshold {
        role: RoleType,
        valid: u64,
        threshold: u64,
        backtrace: Backtrace,
    },

    /// No signing key held by the crypto service matches the role's key IDs.
    #[snafu(display("No signing keys found for role '{}'", role))]
    SigningKeysNotFound { role: RoleType, backtrace: Backtrace },

    /// A system-random operation failed.
    #[snafu(display("Unable to generate random data: {}", source))]
    SystemRandom {
        source: aws_lc_rs::error::Unspecified,
        backtrace: Backtrace,
    },

    /// The named target is not listed in the targets role.
    #[snafu(display("Target not found: {}", name))]
    TargetNotFound { name: String, backtrace: Backtrace },

    /// A role's threshold exceeds the number of keys listed for it.
    #[snafu(display(
        "Role '{}' has threshold {} but only {} key(s)",
        role,
        threshold,
        keys
    ))]
    ThresholdInvalid {
        role: RoleType,
        threshold: u64,
        keys: u64,
        backtrace: Backtrace,
    },

    /// Fetched metadata did not carry the version another role promised.
    #[snafu(display(
        "Fetched version {} of {} metadata, expected {}",
        fetched,
        role,
        expected
    ))]
    VersionMismatch {
        role: RoleType,
        fetched: u64,
        expected: u64,
        backtrace: Backtrace,
    },

    #[snafu(display("Version number overflow"))]
    VersionOverflow { backtrace: Backtrace },

    /// A private key failed to decrypt with the supplied passphrase.
    #[snafu(display("Wrong passphrase for key {}", keyid))]
    WrongPassphrase { keyid: String, backtrace: Backtrace },
}
