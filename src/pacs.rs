//! HTTP client for the OAuth2-protected PACS.
//!
//! One shared [reqwest::Client] serves every uploader task. The token cache
//! holds at most one token; refreshes are serialized through an async lock,
//! and any 401 invalidates the cache and retries exactly once with a fresh
//! token.
use crate::config::ConfigWatcher;
use crate::error::PacsError;
use crate::log_sink::UiLog;
use crate::throttle::{self, ProgressFn};
use crate::types::{SeriesInstanceUid, SopInstanceUid, StudyInstanceUid};
use camino::Utf8Path;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const SHORT_TIMEOUT: Duration = Duration::from_secs(15);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Refresh this long before the token would actually expire, to avoid a 401
/// race against clock skew.
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

struct TokenState {
    access_token: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<f64>,
}

/// The PACS endpoints and credentials from the current settings snapshot.
struct Endpoints {
    base_url: String,
    token_url: String,
    client_id: String,
    client_secret: String,
}

pub struct PacsClient {
    http: reqwest::Client,
    config: Arc<ConfigWatcher>,
    token: Mutex<Option<TokenState>>,
    ui: UiLog,
}

impl PacsClient {
    pub fn new(config: Arc<ConfigWatcher>, ui: UiLog) -> Result<Self, PacsError> {
        let http = reqwest::Client::builder()
            .timeout(SHORT_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            config,
            token: Mutex::new(None),
            ui,
        })
    }

    /// Fails when any of the PACS settings is missing; uploads must not start
    /// in that state.
    pub fn check_configured(&self) -> Result<(), PacsError> {
        self.endpoints().map(|_| ())
    }

    fn endpoints(&self) -> Result<Endpoints, PacsError> {
        let settings = self.config.get();
        let required = |value: &Option<String>, name: &'static str| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or(PacsError::NotConfigured(name))
        };
        Ok(Endpoints {
            base_url: required(&settings.pacs_base_url, "pacs_base_url")?
                .trim_end_matches('/')
                .to_string(),
            token_url: required(&settings.pacs_token_url, "pacs_token_url")?,
            client_id: required(&settings.pacs_client_id, "pacs_client_id")?,
            client_secret: required(&settings.pacs_client_secret, "pacs_client_secret")?,
        })
    }

    async fn fetch_token(&self, endpoints: &Endpoints) -> Result<TokenState, PacsError> {
        let response = self
            .http
            .post(&endpoints.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", endpoints.client_id.as_str()),
                ("client_secret", endpoints.client_secret.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?;
        let body: TokenResponse = response.json().await?;
        let access_token = body
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or(PacsError::MissingAccessToken)?;
        let lifetime = Duration::from_secs_f64(body.expires_in.unwrap_or(0.0).max(0.0));
        let expires_at = Instant::now() + lifetime.saturating_sub(EXPIRY_MARGIN);
        Ok(TokenState {
            access_token,
            expires_at,
        })
    }

    /// The cached token, refreshed when less than the safety margin remains.
    async fn token(&self, endpoints: &Endpoints) -> Result<String, PacsError> {
        let mut cached = self.token.lock().await;
        if let Some(state) = cached.as_ref() {
            if Instant::now() < state.expires_at {
                return Ok(state.access_token.clone());
            }
        }
        let state = self.fetch_token(endpoints).await?;
        let token = state.access_token.clone();
        *cached = Some(state);
        Ok(token)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    /// Send a request built by `build`, retrying exactly once with a fresh
    /// token when the first attempt comes back 401.
    async fn send_authorized<F>(
        &self,
        endpoints: &Endpoints,
        build: F,
    ) -> Result<reqwest::Response, PacsError>
    where
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        let token = self.token(endpoints).await?;
        let response = build(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        self.invalidate_token().await;
        let token = self.token(endpoints).await?;
        Ok(build(&token).send().await?)
    }

    /// `/tools/find` returning the raw JSON array (empty on 404).
    async fn find(
        &self,
        endpoints: &Endpoints,
        level: &str,
        key: &str,
        value: &str,
    ) -> Result<Vec<serde_json::Value>, PacsError> {
        let payload = json!({
            "Level": level,
            "Query": { key: value },
            "Limit": 1,
        });
        let url = format!("{}/tools/find", endpoints.base_url);
        let response = self
            .send_authorized(endpoints, |token| {
                self.http.post(&url).bearer_auth(token).json(&payload)
            })
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let matches = response.error_for_status()?.json().await?;
        Ok(matches)
    }

    /// Whether the PACS already holds this instance. Both the SOP UID and the
    /// series UID must be known, guarding against stale per-instance hits.
    pub async fn instance_exists(
        &self,
        sop_uid: &SopInstanceUid,
        series_uid: &SeriesInstanceUid,
    ) -> Result<bool, PacsError> {
        let endpoints = self.endpoints()?;
        let by_sop = self
            .find(&endpoints, "Instance", "SOPInstanceUID", sop_uid.as_str())
            .await?;
        if by_sop.is_empty() {
            return Ok(false);
        }
        let by_series = self
            .find(
                &endpoints,
                "Instance",
                "SeriesInstanceUID",
                series_uid.as_str(),
            )
            .await?;
        Ok(!by_series.is_empty())
    }

    /// Upload one DICOM file, streaming it through the throttled progress
    /// body. A 401 rebuilds the body and retries once with a fresh token.
    pub async fn upload_instance(
        &self,
        path: &Utf8Path,
        progress: ProgressFn,
    ) -> Result<(), PacsError> {
        let endpoints = self.endpoints()?;
        let url = format!("{}/instances", endpoints.base_url);
        let mut response = self
            .post_instance(&url, path, Arc::clone(&progress), &endpoints)
            .await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            self.invalidate_token().await;
            response = self.post_instance(&url, path, progress, &endpoints).await?;
        }
        if let Err(e) = response.error_for_status_ref() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let body: String = body.trim().chars().take(2000).collect();
            let body = if body.is_empty() { "<empty>".to_string() } else { body };
            self.ui.log_color(
                format!(
                    "PACS upload failed for {}: {status} {body}",
                    path.file_name().unwrap_or(path.as_str())
                ),
                "pacs",
                "red",
            );
            return Err(e.into());
        }
        // The instance descriptor in the response is not used, but an
        // unparsable body still means a broken upload.
        let _descriptor: serde_json::Value = response.json().await?;
        Ok(())
    }

    async fn post_instance(
        &self,
        url: &str,
        path: &Utf8Path,
        progress: ProgressFn,
        endpoints: &Endpoints,
    ) -> Result<reqwest::Response, PacsError> {
        let token = self.token(endpoints).await?;
        let (body, total) = throttle::throttled_file_body(
            path,
            Arc::clone(&self.config),
            progress,
        )
        .await?;
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/dicom")
            .header(reqwest::header::CONTENT_LENGTH, total)
            .body(body)
            .timeout(UPLOAD_TIMEOUT)
            .send()
            .await?;
        Ok(response)
    }

    /// Attach a label to the study. Failures are logged and reported, never
    /// propagated to the scan driver.
    pub async fn add_label(&self, study_uid: &StudyInstanceUid, label: &str) -> bool {
        match self.try_add_label(study_uid, label).await {
            Ok(true) => true,
            Ok(false) => {
                self.ui.log_color(
                    format!("PACS label {label} skipped: study {study_uid} not found"),
                    "pacs",
                    "red",
                );
                false
            }
            Err(e) => {
                tracing::error!(label, message = e.to_string());
                self.ui.log_color(
                    format!("PACS label {label} failed for study {study_uid}: {e}"),
                    "pacs",
                    "red",
                );
                false
            }
        }
    }

    async fn try_add_label(
        &self,
        study_uid: &StudyInstanceUid,
        label: &str,
    ) -> Result<bool, PacsError> {
        let endpoints = self.endpoints()?;
        let matches = self
            .find(&endpoints, "Study", "StudyInstanceUID", study_uid.as_str())
            .await?;
        // Orthanc may answer with bare IDs or with objects carrying an "ID".
        let Some(orthanc_id) = matches.first().and_then(|m| {
            m.as_str()
                .map(str::to_string)
                .or_else(|| m.get("ID").and_then(|v| v.as_str()).map(str::to_string))
        }) else {
            return Ok(false);
        };
        let url = format!(
            "{}/studies/{}/labels/{}",
            endpoints.base_url, orthanc_id, label
        );
        self.send_authorized(&endpoints, |token| self.http.put(&url).bearer_auth(token))
            .await?
            .error_for_status()?;
        Ok(true)
    }
}
