// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provides access to the remote notary server holding the authoritative
//! copies of a collection's metadata plus the server-managed timestamp role.

use crate::error::Result;
use crate::schema::key::Key;
use crate::store::MetadataStore;
use std::sync::Arc;

/// The remote side of a collection: role metadata plus the server's role
/// keys. Missing metadata is reported as
/// [`crate::error::Error::MetaNotFound`], which the publish pipeline uses as
/// control flow; all other failures are
/// [`crate::error::Error::RemoteUnavailable`].
pub trait RemoteStore: MetadataStore {
    /// Fetches the server's public key for a role (in practice: "timestamp").
    fn get_key(&self, role: &str) -> Result<Key>;
}

impl<T: RemoteStore + ?Sized> RemoteStore for Arc<T> {
    fn get_key(&self, role: &str) -> Result<Key> {
        (**self).get_key(role)
    }
}

#[cfg(feature = "http")]
pub use self::http::HttpRemoteStore;

#[cfg(feature = "http")]
mod http {
    use super::RemoteStore;
    use crate::error::{self, Result};
    use crate::io::read_capped;
    use crate::schema::key::Key;
    use crate::store::{encode_filename, MetadataStore};
    use log::debug;
    use reqwest::blocking::Client;
    use reqwest::StatusCode;
    use snafu::ResultExt;
    use url::Url;

    const MAX_KEY_SIZE: u64 = 1024 * 1024;

    /// A `RemoteStore` speaking the notary wire protocol over HTTP:
    /// `GET`/`PUT` on `<base>/v2/<gun>/_trust/tuf/<role>.json` and `GET` on
    /// `<base>/v2/<gun>/_trust/tuf/<role>.key`.
    #[derive(Debug, Clone)]
    pub struct HttpRemoteStore {
        client: Client,
        base: Url,
        gun: String,
    }

    impl HttpRemoteStore {
        /// Creates a remote store for a collection on the given server.
        pub fn new(base_url: &str, gun: &str) -> Result<Self> {
            let mut base = base_url.to_string();
            if !base.ends_with('/') {
                base.push('/');
            }
            let base = Url::parse(&base).context(error::ParseUrlSnafu { url: base_url })?;
            Ok(Self {
                client: Client::new(),
                base,
                gun: gun.to_string(),
            })
        }

        fn role_url(&self, role: &str, extension: &str) -> Result<Url> {
            let path = format!(
                "v2/{}/_trust/tuf/{}.{}",
                self.gun,
                encode_filename(role),
                extension
            );
            self.base
                .join(&path)
                .context(error::ParseUrlSnafu { url: path })
        }
    }

    fn unavailable(url: &Url, reason: impl ToString) -> crate::error::Error {
        error::RemoteUnavailableSnafu {
            url: url.to_string(),
            reason: reason.to_string(),
        }
        .build()
    }

    impl MetadataStore for HttpRemoteStore {
        fn get_meta(&self, role: &str, max_size: u64) -> Result<Vec<u8>> {
            let url = self.role_url(role, "json")?;
            debug!("GET {}", url);
            let response = self
                .client
                .get(url.clone())
                .send()
                .map_err(|err| unavailable(&url, err))?;
            if response.status() == StatusCode::NOT_FOUND {
                return error::MetaNotFoundSnafu { role }.fail();
            }
            if !response.status().is_success() {
                return Err(unavailable(&url, response.status()));
            }
            read_capped(response, max_size, "remote metadata limit")
        }

        fn set_meta(&self, role: &str, bytes: &[u8]) -> Result<()> {
            let url = self.role_url(role, "json")?;
            debug!("PUT {} ({} bytes)", url, bytes.len());
            let response = self
                .client
                .put(url.clone())
                .body(bytes.to_vec())
                .send()
                .map_err(|err| unavailable(&url, err))?;
            if !response.status().is_success() {
                return Err(unavailable(&url, response.status()));
            }
            Ok(())
        }
    }

    impl RemoteStore for HttpRemoteStore {
        fn get_key(&self, role: &str) -> Result<Key> {
            let url = self.role_url(role, "key")?;
            debug!("GET {}", url);
            let response = self
                .client
                .get(url.clone())
                .send()
                .map_err(|err| unavailable(&url, err))?;
            if response.status() == StatusCode::NOT_FOUND {
                return error::MetaNotFoundSnafu { role }.fail();
            }
            if !response.status().is_success() {
                return Err(unavailable(&url, response.status()));
            }
            let body = read_capped(response, MAX_KEY_SIZE, "remote key limit")?;
            serde_json::from_slice(&body).context(error::ParseMetadataSnafu {
                role: crate::schema::RoleType::Timestamp,
            })
        }
    }
}
