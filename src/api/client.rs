//! HTTP client for the content API.

use super::error::{describe_error_body, error_message, is_domain_status};
use super::models::{AccessToken, ApiResponse, DownloadRequest, ResultPage, TokenResponse};
use super::{ApiError, ContentApi};
use crate::config::ApiSettings;
use crate::rate_limit::{CallClass, RateLimitHeaders};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub struct HttpContentApi {
    client: reqwest::Client,
    base_url: String,
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: String,
    token: Mutex<Option<AccessToken>>,
}

impl HttpContentApi {
    pub fn new(settings: &ApiSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            token_url: settings.token_url.clone(),
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            scope: settings.scope.clone(),
            token: Mutex::new(None),
        })
    }

    async fn bearer(&self) -> Result<String, ApiError> {
        self.authenticate().await?;
        self.token
            .lock()
            .await
            .as_ref()
            .map(|t| t.value.clone())
            .ok_or_else(|| ApiError::Auth("no access token".to_string()))
    }

    async fn get(&self, resource: &str, params: &[(&str, String)]) -> Result<ApiResponse, ApiError> {
        let url = format!("{}/{}", self.base_url, resource);
        let bearer = self.bearer().await?;

        let response = self
            .client
            .get(&url)
            .bearer_auth(bearer)
            .query(params)
            .send()
            .await
            .map_err(|e| ApiError::Transient {
                url: url.clone(),
                message: e.to_string(),
            })?;

        let status = response.status().as_u16();
        let request_url = response.url().to_string();
        let rate_limits = RateLimitHeaders::from_header_map(response.headers());
        let body = response.text().await.map_err(|e| ApiError::Transient {
            url: request_url.clone(),
            message: e.to_string(),
        })?;
        debug!("GET {} -> {}", request_url, status);

        if status == 401 {
            // token was revoked or expired early
            self.token.lock().await.take();
            return Err(ApiError::Auth(describe_error_body(&body)));
        }
        if is_domain_status(status) {
            return Err(ApiError::Domain {
                url: request_url,
                status: Some(status),
                message: describe_error_body(&body),
                rate_limits: rate_limits.ok().flatten(),
            });
        }
        if !(200..300).contains(&status) {
            return Err(ApiError::Rejected {
                url: request_url,
                status,
                message: describe_error_body(&body),
            });
        }

        let value: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| ApiError::Domain {
                url: request_url.clone(),
                status: Some(status),
                message: format!("could not parse response: {}", e),
                rate_limits: None,
            })?;
        if value.get("error").is_some() {
            return Err(ApiError::Rejected {
                url: request_url,
                status,
                message: error_message(&value).unwrap_or_default(),
            });
        }
        let page: ResultPage = serde_json::from_value(value).map_err(|e| ApiError::Domain {
            url: request_url.clone(),
            status: Some(status),
            message: format!("unexpected response shape: {}", e),
            rate_limits: None,
        })?;
        let rate_limits = rate_limits.map_err(|e| ApiError::Domain {
            url: request_url.clone(),
            status: Some(status),
            message: e.to_string(),
            rate_limits: None,
        })?;

        Ok(ApiResponse {
            request_url,
            status,
            page,
            rate_limits,
        })
    }
}

#[async_trait]
impl ContentApi for HttpContentApi {
    async fn authenticate(&self) -> Result<(), ApiError> {
        let mut token = self.token.lock().await;
        if token.as_ref().is_some_and(|t| t.is_valid(Utc::now())) {
            return Ok(());
        }

        info!("Obtaining new access token");
        let response = self
            .client
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials"), ("scope", self.scope.as_str())])
            .send()
            .await
            .map_err(|e| ApiError::Auth(format!("token request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::Auth(format!("token response unreadable: {}", e)))?;
        if !status.is_success() {
            return Err(ApiError::Auth(format!(
                "status {}: {}",
                status,
                describe_error_body(&body)
            )));
        }

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| ApiError::Auth(format!("invalid token response: {}", e)))?;
        let fresh = parsed
            .into_token(Utc::now())
            .ok_or_else(|| ApiError::Auth("token response has no usable expires_in".to_string()))?;
        *token = Some(fresh);
        Ok(())
    }

    async fn download(&self, request: &DownloadRequest) -> Result<ApiResponse, ApiError> {
        self.get("News", &request.query_params()).await
    }

    async fn sources(&self, skip: i64, top: i64) -> Result<ApiResponse, ApiError> {
        self.get(
            "Sources",
            &[("$top", top.to_string()), ("$skip", skip.to_string())],
        )
        .await
    }

    async fn sample_quota(&self, class: CallClass) -> Result<ApiResponse, ApiError> {
        let top = ("$top", "1".to_string());
        match class {
            CallClass::Search => self.get("News", &[top]).await,
            CallClass::Download => {
                self.get("News", &[("$expand", "Document".to_string()), top])
                    .await
            }
            CallClass::Sources => self.get("Sources", &[top]).await,
        }
    }
}
