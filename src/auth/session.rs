//! Authentication session lifecycle.
//!
//! `AuthSession` owns the OAuth device authorization flow, authorization-code
//! exchange, token refresh, companion registration, and logout. Refresh is
//! single-flight: any number of concurrent callers share one network refresh,
//! and the refresh itself runs in a spawned task so a cancelled caller cannot
//! abort it for the others.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::api::error::{ApiError, DeviceFlowError};
use crate::api::transport::{ApiRequest, ApiResponse, HttpTransport, DPOP_NONCE_HEADER};
use crate::auth::credentials::CredentialStore;
use crate::auth::proof::ProofGenerator;
use crate::config::ApiConfig;

// ============================================================================
// Constants
// ============================================================================

/// Device authorization grant type (RFC 8628)
const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Seconds added to the poll interval on each `slow_down` response
const SLOW_DOWN_INCREMENT_SECS: u64 = 5;

/// Maximum immediate retries after a clock-skew or nonce rejection before
/// the attempt is treated as fatal.
const MAX_SKEW_RETRIES: u32 = 3;

/// Fallback poll interval when the server omits one
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCodeResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    pub expires_in: u64,
    #[serde(default = "default_poll_interval")]
    pub interval: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CompanionRegisterResponse {
    #[serde(rename = "apiKey")]
    api_key: String,
}

/// A pending device authorization, handed to the UI for display and back to
/// `poll_for_token` to complete.
#[derive(Debug, Clone)]
pub struct DeviceFlowSession {
    pub device_code: String,
    /// Short code the user types at the verification URI
    pub user_code: String,
    pub verification_uri: String,
    /// Pre-filled variant for QR display, when the server supplies one
    pub verification_uri_complete: Option<String>,
    pub poll_interval_secs: u64,
    pub expires_in_secs: u64,
}

/// Observable state of the device login flow, for UI consumption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceFlowState {
    Idle,
    Requesting,
    Polling,
    Success,
    Error(String),
}

/// Cloneable refresh outcome, shared between all waiters of one flight.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct RefreshError(String);

type RefreshFlight = Shared<BoxFuture<'static, Result<(), RefreshError>>>;

// ============================================================================
// Token endpoint client
// ============================================================================

/// The network half of the session, kept behind its own Arc so a spawned
/// refresh can outlive any individual caller.
struct TokenClient {
    config: ApiConfig,
    credentials: Arc<CredentialStore>,
    proofs: Arc<ProofGenerator>,
    transport: Arc<dyn HttpTransport>,
}

impl TokenClient {
    /// One signed POST to the token endpoint. Captures any nonce the server
    /// hands back.
    async fn token_request(&self, form: &[(&str, &str)]) -> Result<ApiResponse, ApiError> {
        let token_url = self.config.token_endpoint();
        let nonce = self.credentials.dpop_nonce();
        let proof = self
            .proofs
            .generate("POST", &token_url, None, nonce.as_deref())?;

        let request = ApiRequest::post(&token_url)
            .header("DPoP", proof)
            .form(form);
        let response = self.transport.send(request).await?;

        if let Some(nonce) = response.header(DPOP_NONCE_HEADER) {
            self.credentials.set_dpop_nonce(nonce);
        }
        Ok(response)
    }

    /// Signed token request that expects a grant back. Clock-skew and nonce
    /// rejections get a bounded number of immediate retries.
    async fn token_grant(&self, form: &[(&str, &str)]) -> Result<TokenResponse, ApiError> {
        let mut skew_retries = 0u32;
        loop {
            let response = self.token_request(form).await?;
            if response.is_success() {
                return response.json();
            }

            if response.status.as_u16() == 400 && skew_retries < MAX_SKEW_RETRIES {
                if let DeviceFlowError::ClockSkewRetry(offset) = classify_poll_rejection(&response)
                {
                    skew_retries += 1;
                    self.credentials.set_clock_offset_seconds(offset);
                    warn!(offset, "Correcting device clock offset and retrying");
                    continue;
                }
            }

            return Err(ApiError::from_status(response.status, &response.text()));
        }
    }

    fn store_grant(&self, tokens: &TokenResponse) {
        let expires_at = Utc::now().timestamp() + tokens.expires_in;
        self.credentials.store_tokens(
            &tokens.access_token,
            tokens.refresh_token.as_deref(),
            expires_at,
        );
    }

    async fn run_refresh(self: Arc<Self>) -> Result<(), RefreshError> {
        let Some(refresh_token) = self.credentials.refresh_token() else {
            return Err(RefreshError("no refresh token".to_string()));
        };

        info!("Refreshing access token");
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", self.config.client_id.as_str()),
            ("refresh_token", refresh_token.as_str()),
        ];

        match self.token_grant(&form).await {
            Ok(tokens) => {
                self.store_grant(&tokens);
                info!("Access token refreshed");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Refresh rejected, clearing OAuth tokens");
                self.credentials.clear_oauth_tokens();
                Err(RefreshError(e.to_string()))
            }
        }
    }
}

// ============================================================================
// AuthSession
// ============================================================================

pub struct AuthSession {
    tokens: Arc<TokenClient>,
    refresh_flight: Arc<Mutex<Option<RefreshFlight>>>,
    device_state: RwLock<DeviceFlowState>,
}

impl AuthSession {
    pub fn new(
        config: ApiConfig,
        credentials: Arc<CredentialStore>,
        proofs: Arc<ProofGenerator>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            tokens: Arc::new(TokenClient {
                config,
                credentials,
                proofs,
                transport,
            }),
            refresh_flight: Arc::new(Mutex::new(None)),
            device_state: RwLock::new(DeviceFlowState::Idle),
        }
    }

    fn config(&self) -> &ApiConfig {
        &self.tokens.config
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.tokens.credentials
    }

    pub fn device_state(&self) -> DeviceFlowState {
        self.device_state.read().unwrap().clone()
    }

    fn set_device_state(&self, state: DeviceFlowState) {
        *self.device_state.write().unwrap() = state;
    }

    /// True when any credential (OAuth tokens or legacy cookie) exists.
    pub fn is_authenticated(&self) -> bool {
        !self.tokens.credentials.is_empty()
    }

    /// True when the access token should be refreshed before use.
    pub fn needs_refresh(&self) -> bool {
        self.tokens.credentials.refresh_token().is_some()
            && self
                .tokens
                .credentials
                .is_token_expired(Utc::now().timestamp())
    }

    // ========================================================================
    // Device authorization flow
    // ========================================================================

    /// Start the device flow: fetch a user code for display. Leaves the flow
    /// in `Polling` state; call `poll_for_token` next.
    pub async fn start_device_auth(&self) -> Result<DeviceFlowSession, ApiError> {
        self.set_device_state(DeviceFlowState::Requesting);

        let request = ApiRequest::post(self.config().device_endpoint()).form(&[
            ("client_id", self.config().client_id.as_str()),
            ("scope", self.config().scope.as_str()),
        ]);

        let response = match self.tokens.transport.send(request).await {
            Ok(response) => response,
            Err(e) => {
                self.set_device_state(DeviceFlowState::Error(e.to_string()));
                return Err(e);
            }
        };

        if !response.is_success() {
            let err = ApiError::from_status(response.status, &response.text());
            self.set_device_state(DeviceFlowState::Error(err.to_string()));
            return Err(err);
        }

        let device: DeviceCodeResponse = match response.json() {
            Ok(device) => device,
            Err(_) => {
                let err = ApiError::InvalidResponse(
                    "device endpoint returned an unrecognized body".to_string(),
                );
                self.set_device_state(DeviceFlowState::Error(err.to_string()));
                return Err(err);
            }
        };

        info!(user_code = %device.user_code, "Device authorization started");
        self.set_device_state(DeviceFlowState::Polling);

        Ok(DeviceFlowSession {
            device_code: device.device_code,
            user_code: device.user_code,
            verification_uri: device.verification_uri,
            verification_uri_complete: device.verification_uri_complete,
            poll_interval_secs: device.interval,
            expires_in_secs: device.expires_in,
        })
    }

    /// Poll the token endpoint until the user approves, the code expires, or
    /// the server rejects the grant. Each attempt is signed with a fresh
    /// proof; clock-skew rejections correct the stored offset and retry
    /// without sleeping.
    pub async fn poll_for_token(&self, flow: &DeviceFlowSession) -> Result<(), ApiError> {
        let started = tokio::time::Instant::now();
        let mut wait_secs = flow.poll_interval_secs.max(1);
        let mut skew_retries = 0u32;

        'poll: loop {
            tokio::time::sleep(Duration::from_secs(wait_secs)).await;

            if flow.expires_in_secs > 0
                && started.elapsed() >= Duration::from_secs(flow.expires_in_secs)
            {
                return Err(self.fail_device_flow("device code expired"));
            }

            // Inner loop: immediate retries after a skew correction
            loop {
                let response = match self
                    .tokens
                    .token_request(&[
                        ("grant_type", DEVICE_GRANT_TYPE),
                        ("client_id", self.config().client_id.as_str()),
                        ("device_code", flow.device_code.as_str()),
                    ])
                    .await
                {
                    Ok(response) => response,
                    Err(e) => {
                        self.set_device_state(DeviceFlowState::Error(e.to_string()));
                        return Err(e);
                    }
                };

                if response.is_success() {
                    let tokens: TokenResponse = response.json()?;
                    self.tokens.store_grant(&tokens);
                    self.set_device_state(DeviceFlowState::Success);
                    info!("Device authorization complete");
                    return Ok(());
                }

                if response.status.as_u16() != 400 {
                    let err = ApiError::from_status(response.status, &response.text());
                    self.set_device_state(DeviceFlowState::Error(err.to_string()));
                    return Err(err);
                }

                match classify_poll_rejection(&response) {
                    DeviceFlowError::Pending => continue 'poll,
                    DeviceFlowError::SlowDown => {
                        wait_secs += SLOW_DOWN_INCREMENT_SECS;
                        debug!(wait_secs, "Server asked us to slow down");
                        continue 'poll;
                    }
                    DeviceFlowError::ClockSkewRetry(offset) => {
                        if skew_retries >= MAX_SKEW_RETRIES {
                            return Err(
                                self.fail_device_flow("proof rejected after skew correction")
                            );
                        }
                        skew_retries += 1;
                        self.tokens.credentials.set_clock_offset_seconds(offset);
                        warn!(offset, "Correcting device clock offset and retrying");
                        continue;
                    }
                    DeviceFlowError::Fatal(reason) => {
                        return Err(self.fail_device_flow(&reason));
                    }
                }
            }
        }
    }

    fn fail_device_flow(&self, reason: &str) -> ApiError {
        self.set_device_state(DeviceFlowState::Error(reason.to_string()));
        ApiError::HttpError {
            status: 400,
            message: reason.to_string(),
        }
    }

    // ========================================================================
    // Authorization-code exchange
    // ========================================================================

    /// Exchange an authorization code (PKCE) for a token set.
    pub async fn exchange_authorization_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: Option<&str>,
    ) -> Result<(), ApiError> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("client_id", self.config().client_id.as_str()),
            ("code", code),
            ("code_verifier", code_verifier),
        ];
        if let Some(uri) = redirect_uri {
            form.push(("redirect_uri", uri));
        }

        let tokens = self.tokens.token_grant(&form).await?;
        self.tokens.store_grant(&tokens);
        info!("Authorization code exchanged");
        Ok(())
    }

    // ========================================================================
    // Token refresh (single-flight)
    // ========================================================================

    /// Refresh the access token. Concurrent callers join the same in-flight
    /// refresh; exactly one network request happens per flight. On failure
    /// the OAuth tokens are cleared and `NotAuthenticated` is returned.
    pub async fn refresh(&self) -> Result<(), ApiError> {
        let flight = {
            let mut slot = self.refresh_flight.lock().await;
            match slot.as_ref() {
                Some(flight) => {
                    debug!("Joining in-flight token refresh");
                    flight.clone()
                }
                None => {
                    // Spawned so a cancelled waiter cannot abort the refresh
                    // out from under the others.
                    let task = tokio::spawn(Arc::clone(&self.tokens).run_refresh());
                    let flight: RefreshFlight = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(e) => Err(RefreshError(format!("refresh task failed: {e}"))),
                        }
                    }
                    .boxed()
                    .shared();
                    *slot = Some(flight.clone());

                    // The flight empties its own slot when it completes, so
                    // a finished result never lingers there even if every
                    // waiter was cancelled.
                    let slot_handle = Arc::clone(&self.refresh_flight);
                    let finished = flight.clone();
                    tokio::spawn(async move {
                        let _ = finished.clone().await;
                        let mut slot = slot_handle.lock().await;
                        if slot.as_ref().is_some_and(|f| f.ptr_eq(&finished)) {
                            *slot = None;
                        }
                    });

                    flight
                }
            }
        };

        let result = flight.clone().await;

        // Waiters also clear eagerly so a back-to-back refresh never joins
        // an already-finished flight.
        {
            let mut slot = self.refresh_flight.lock().await;
            if slot.as_ref().is_some_and(|f| f.ptr_eq(&flight)) {
                *slot = None;
            }
        }

        result.map_err(|e| {
            warn!(error = %e, "Token refresh failed");
            ApiError::NotAuthenticated
        })
    }

    // ========================================================================
    // Companion registration
    // ========================================================================

    /// Register this device with the companion service. The registration
    /// payload proves possession of the device key via a proof bound to the
    /// identity endpoint and the current access token.
    pub async fn register_companion(&self) -> Result<String, ApiError> {
        let token = self
            .tokens
            .credentials
            .access_token()
            .ok_or(ApiError::NotAuthenticated)?;

        let identity_url = self.config().identity_url();
        let nonce = self.tokens.credentials.dpop_nonce();
        let proof = self
            .tokens
            .proofs
            .generate("GET", &identity_url, Some(&token), nonce.as_deref())?;

        let request = ApiRequest::post(self.config().companion_register_endpoint()).json(json!({
            "accessToken": token,
            "dpopProof": proof,
        }));

        let response = self.tokens.transport.send(request).await?;
        if !response.is_success() {
            warn!(status = %response.status, "Companion registration rejected");
            return Err(ApiError::RegistrationFailed(format!(
                "status {}",
                response.status
            )));
        }

        let registered: CompanionRegisterResponse = response
            .json()
            .map_err(|e| ApiError::RegistrationFailed(e.to_string()))?;
        self.tokens
            .credentials
            .set_companion_api_key(Some(&registered.api_key));
        info!("Companion registration complete");
        Ok(registered.api_key)
    }

    // ========================================================================
    // Logout
    // ========================================================================

    /// Revoke the refresh token (best effort) and clear every session
    /// credential. Local state is cleared even when the server call fails.
    pub async fn logout(&self) {
        if let Some(refresh_token) = self.tokens.credentials.refresh_token() {
            let request = ApiRequest::post(self.config().logout_endpoint()).form(&[
                ("client_id", self.config().client_id.as_str()),
                ("refresh_token", refresh_token.as_str()),
            ]);
            match self.tokens.transport.send(request).await {
                Ok(response) if !response.is_success() => {
                    warn!(status = %response.status, "Server-side logout failed");
                }
                Err(e) => warn!(error = %e, "Server-side logout failed"),
                Ok(_) => {}
            }
        }

        self.tokens.credentials.clear_session();
        self.set_device_state(DeviceFlowState::Idle);
        info!("Logged out");
    }
}

// ============================================================================
// Poll rejection classification
// ============================================================================

/// Map a 400 from the token endpoint during polling to what the loop should
/// do next. Unparsable bodies are terminal: an unattended poll loop must not
/// spin forever on garbage.
fn classify_poll_rejection(response: &ApiResponse) -> DeviceFlowError {
    let rejection: OAuthErrorResponse = match response.json() {
        Ok(rejection) => rejection,
        Err(_) => {
            return DeviceFlowError::Fatal("unrecognized token endpoint response".to_string())
        }
    };

    match rejection.error.as_str() {
        "authorization_pending" => DeviceFlowError::Pending,
        "slow_down" => DeviceFlowError::SlowDown,
        error => {
            let description = rejection.error_description.unwrap_or_default();
            if error == "use_dpop_nonce" || mentions_clock_skew(&description) {
                if let Some(server_unix) = response_date_unix(response) {
                    return DeviceFlowError::ClockSkewRetry(server_unix - Utc::now().timestamp());
                }
            }
            if description.is_empty() {
                DeviceFlowError::Fatal(error.to_string())
            } else {
                DeviceFlowError::Fatal(description)
            }
        }
    }
}

/// Does an `error_description` describe the proof falling outside the
/// server's acceptance window?
fn mentions_clock_skew(description: &str) -> bool {
    let lower = description.to_lowercase();
    if lower.contains("clock") || lower.contains("skew") {
        return true;
    }
    if lower.contains("proof")
        && (lower.contains("window") || lower.contains("expired") || lower.contains("future"))
    {
        return true;
    }
    // "iat" as a standalone token, not a substring of another word
    lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|word| word == "iat")
}

/// Server time from the response `Date` header, unix seconds.
fn response_date_unix(response: &ApiResponse) -> Option<i64> {
    let date = response.header("date")?;
    DateTime::parse_from_rfc2822(date)
        .ok()
        .map(|dt| dt.timestamp())
}
