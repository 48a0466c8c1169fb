//! Blob-storage template store over plain HTTP.
//!
//! Fetches `{account_url}/{container}/{name}`, authorizing with an optional
//! SAS token appended as the query string.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use super::traits::TemplateStore;
use crate::error::StoreError;

/// Reads templates from a blob container.
pub struct HttpBlobStore {
    account_url: String,
    container: String,
    sas_token: Option<SecretString>,
    http: Client,
}

impl std::fmt::Debug for HttpBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBlobStore")
            .field("account_url", &self.account_url)
            .field("container", &self.container)
            .field("sas_token", &self.sas_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl HttpBlobStore {
    pub fn new(
        account_url: impl Into<String>,
        container: impl Into<String>,
        sas_token: Option<SecretString>,
    ) -> Self {
        Self {
            account_url: account_url.into().trim_end_matches('/').to_string(),
            container: container.into().trim_matches('/').to_string(),
            sas_token,
            http: Client::new(),
        }
    }

    /// Blob URL without credentials. `/` in `name` separates virtual
    /// directories; every segment is percent-encoded.
    fn blob_url(&self, name: &str) -> Result<Url, StoreError> {
        let mut url = Url::parse(&self.account_url)
            .map_err(|e| StoreError::Http(format!("invalid account URL {}: {e}", self.account_url)))?;
        url.path_segments_mut()
            .map_err(|()| StoreError::Http(format!("account URL {} cannot carry a path", self.account_url)))?
            .pop_if_empty()
            .push(&self.container)
            .extend(name.trim_start_matches('/').split('/'));
        Ok(url)
    }
}

#[async_trait]
impl TemplateStore for HttpBlobStore {
    async fn fetch(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        let url = self.blob_url(name)?;
        debug!(url = %url, "Fetching template blob");

        let mut request_url = url.clone();
        if let Some(sas) = &self.sas_token {
            request_url.set_query(Some(sas.expose_secret().trim_start_matches('?')));
        }

        let response = self
            .http
            .get(request_url)
            .send()
            .await
            .map_err(|e| StoreError::Http(e.without_url().to_string()))?;

        match response.status() {
            status if status.is_success() => {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| StoreError::Http(e.without_url().to_string()))?;
                Ok(bytes.to_vec())
            }
            StatusCode::NOT_FOUND => Err(StoreError::NotFound {
                name: name.to_string(),
            }),
            status => Err(StoreError::Http(format!(
                "GET {} returned HTTP {}",
                url,
                status.as_u16()
            ))),
        }
    }

    fn describe(&self) -> String {
        format!("blob container {}/{}", self.account_url, self.container)
    }
}
