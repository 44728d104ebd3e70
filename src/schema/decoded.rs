// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provides the `Decoded` type, a wrapper for bytes that de/serialize as an
//! encoded string, remembering the original string so that signatures over
//! it remain stable.

use crate::error::{self, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Borrow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::Deref;

/// A string encoding scheme used in TUF metadata.
pub trait Encoding {
    /// The name of the encoding, used in error reporting.
    const NAME: &'static str;

    /// Encodes bytes as a string.
    fn encode(bytes: &[u8]) -> String;

    /// Decodes a string into bytes.
    fn decode(s: &str) -> Result<Vec<u8>>;
}

/// Lowercase hexadecimal encoding (used for key IDs and signatures).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hex;

impl Encoding for Hex {
    const NAME: &'static str = "hex";

    fn encode(bytes: &[u8]) -> String {
        hex::encode(bytes)
    }

    fn decode(s: &str) -> Result<Vec<u8>> {
        hex::decode(s).map_err(|err| {
            error::DecodeSnafu {
                encoding: Self::NAME,
                reason: err.to_string(),
            }
            .build()
        })
    }
}

/// Standard base64 encoding (used for public key material).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Base64;

impl Encoding for Base64 {
    const NAME: &'static str = "base64";

    fn encode(bytes: &[u8]) -> String {
        STANDARD.encode(bytes)
    }

    fn decode(s: &str) -> Result<Vec<u8>> {
        STANDARD.decode(s).map_err(|err| {
            error::DecodeSnafu {
                encoding: Self::NAME,
                reason: err.to_string(),
            }
            .build()
        })
    }
}

/// Bytes that de/serialize as a string in the encoding `T`.
///
/// Equality and hashing consider only the decoded bytes, so two values that
/// differ in, say, hex case are equal. The original string is kept and
/// re-serialized verbatim so that canonical forms survive a round trip.
#[derive(Clone, Default)]
pub struct Decoded<T> {
    bytes: Vec<u8>,
    original: String,
    spooky: PhantomData<T>,
}

impl<T: Encoding> Decoded<T> {
    /// Parses a string in the encoding `T`.
    pub fn from_encoded(s: &str) -> Result<Self> {
        Ok(Self {
            bytes: T::decode(s)?,
            original: s.to_owned(),
            spooky: PhantomData,
        })
    }
}

impl<T: Encoding> From<Vec<u8>> for Decoded<T> {
    fn from(bytes: Vec<u8>) -> Self {
        let original = T::encode(&bytes);
        Self {
            bytes,
            original,
            spooky: PhantomData,
        }
    }
}

impl<T> Deref for Decoded<T> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl<T> AsRef<[u8]> for Decoded<T> {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl<T> Borrow<[u8]> for Decoded<T> {
    fn borrow(&self) -> &[u8] {
        &self.bytes
    }
}

impl<T> PartialEq for Decoded<T> {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl<T> Eq for Decoded<T> {}

impl<T> Hash for Decoded<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl<T> fmt::Debug for Decoded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.original, f)
    }
}

impl<T> fmt::Display for Decoded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.original, f)
    }
}

impl<'de, T: Encoding> Deserialize<'de> for Decoded<T> {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let original = String::deserialize(deserializer)?;
        Ok(Self {
            bytes: T::decode(&original).map_err(serde::de::Error::custom)?,
            original,
            spooky: PhantomData,
        })
    }
}

impl<T> Serialize for Decoded<T> {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.original)
    }
}
