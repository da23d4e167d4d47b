// ABOUTME: HTTPS implementation of the ControlPlane trait using reqwest.
// ABOUTME: Maps platform status codes onto the crate's error taxonomy.

use super::{ControlPlane, CredentialGrant, EndpointRecord, FeatureState};
use crate::config::ExecConfig;
use crate::error::{Error, Result};
use crate::types::{AppName, Target};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::HashMap;
use zeroize::Zeroizing;

const API_ACCEPT: &str = "application/vnd.heroku+json; version=3";

/// Longest slice of an error body carried into error messages.
const MAX_ERROR_BODY: usize = 256;

/// Platform API client, built once per invocation.
pub struct HttpControlPlane {
    client: Client,
    api_url: String,
    token: Zeroizing<String>,
}

impl std::fmt::Debug for HttpControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpControlPlane")
            .field("api_url", &self.api_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl HttpControlPlane {
    pub fn new(config: &ExecConfig) -> Result<Self> {
        let token = config.api_token()?;
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(concat!("dyno-exec/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn api(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    fn exec_path(exec_url: &str, target: &Target) -> String {
        format!(
            "{}/api/v2/{}/{}",
            exec_url.trim_end_matches('/'),
            urlencoding::encode(target.app().as_str()),
            urlencoding::encode(target.dyno().as_str())
        )
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn feature_state(&self, app: &AppName, feature: &str) -> Result<FeatureState> {
        let url = self.api(&format!(
            "/apps/{}/features/{}",
            urlencoding::encode(app.as_str()),
            urlencoding::encode(feature)
        ));
        tracing::debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(self.token.as_str())
            .header(reqwest::header::ACCEPT, API_ACCEPT)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(FeatureState { enabled: false });
        }
        decode(response, "feature lookup").await
    }

    async fn config_vars(&self, app: &AppName) -> Result<HashMap<String, String>> {
        let url = self.api(&format!(
            "/apps/{}/config-vars",
            urlencoding::encode(app.as_str())
        ));
        tracing::debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(self.token.as_str())
            .header(reqwest::header::ACCEPT, API_ACCEPT)
            .send()
            .await?;

        decode(response, "config vars").await
    }

    async fn register_client_key(
        &self,
        exec_url: &str,
        target: &Target,
        public_key: &str,
    ) -> Result<CredentialGrant> {
        let url = Self::exec_path(exec_url, target);
        tracing::debug!("PUT {}", url);

        let response = self
            .client
            .put(&url)
            .basic_auth("", Some(self.token.as_str()))
            .json(&json!({ "client_key": public_key }))
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let body = error_body(response).await;
                Err(Error::AuthDenied(body))
            }
            StatusCode::NOT_FOUND => Err(Error::FeatureNotEnabled {
                target: target.to_string(),
                hint: "the dyno is not running the exec agent; restart it after enabling the feature"
                    .to_string(),
            }),
            _ => decode(response, "credential issuance").await,
        }
    }

    async fn lookup_endpoint(&self, exec_url: &str, target: &Target) -> Result<EndpointRecord> {
        let url = format!("{}/tunnel", Self::exec_path(exec_url, target));
        tracing::debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .basic_auth("", Some(self.token.as_str()))
            .send()
            .await?;

        decode(response, "endpoint lookup").await
    }
}

async fn decode<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = error_body(response).await;
        return Err(Error::Network(format!("{what} returned {status}: {body}")));
    }

    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::Network(format!("malformed {what} response: {e}")))
}

async fn error_body(response: Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let body = body.trim();
    if body.is_empty() {
        return status.to_string();
    }
    body.chars().take(MAX_ERROR_BODY).collect()
}
