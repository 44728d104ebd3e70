// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::error::{self, Result};
use aws_lc_rs::digest::{digest, SHA256};
use snafu::{ensure, ResultExt};
use std::io::Read;

/// Reads at most `max_size` bytes from `reader`. If the stream continues past
/// the limit the read is abandoned with an error naming `specifier`, the
/// setting that imposed the limit.
pub(crate) fn read_capped<R: Read>(
    mut reader: R,
    max_size: u64,
    specifier: &'static str,
) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let read = reader
        .by_ref()
        .take(max_size.saturating_add(1))
        .read_to_end(&mut buf)
        .context(error::ReadStreamSnafu { specifier })?;
    ensure!(
        read as u64 <= max_size,
        error::MaxSizeExceededSnafu {
            max_size,
            specifier
        }
    );
    Ok(buf)
}

/// The SHA-256 digest of `bytes`.
pub(crate) fn sha256(bytes: &[u8]) -> Vec<u8> {
    digest(&SHA256, bytes).as_ref().to_vec()
}

/// Checks fetched bytes against an expected SHA-256 digest.
pub(crate) fn verify_sha256(bytes: &[u8], expected: &[u8], context: &str) -> Result<()> {
    let calculated = sha256(bytes);
    ensure!(
        calculated == expected,
        error::HashMismatchSnafu {
            context: context.to_string(),
            calculated: hex::encode(&calculated),
            expected: hex::encode(expected),
        }
    );
    Ok(())
}
