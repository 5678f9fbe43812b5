//! Authenticated request execution.
//!
//! `RequestExecutor` is the single path every authenticated API call takes:
//! it attaches the right auth headers (DPoP-bound token, bearer fallback, or
//! legacy cookie), captures server-issued nonces, and transparently recovers
//! from nonce challenges and expired-token 401s before handing the response
//! back.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::api::error::ApiError;
use crate::api::transport::{ApiRequest, ApiResponse, HttpTransport, DPOP_NONCE_HEADER};
use crate::auth::credentials::CredentialStore;
use crate::auth::proof::ProofGenerator;
use crate::auth::session::AuthSession;
use crate::config::ApiConfig;

/// Maximum retries after a `use_dpop_nonce` challenge.
/// One is normally enough; 3 guards against a server cycling nonces.
const MAX_NONCE_RETRIES: u32 = 3;

pub struct RequestExecutor {
    config: ApiConfig,
    credentials: Arc<CredentialStore>,
    proofs: Arc<ProofGenerator>,
    transport: Arc<dyn HttpTransport>,
    session: Arc<AuthSession>,
}

impl RequestExecutor {
    pub fn new(
        config: ApiConfig,
        credentials: Arc<CredentialStore>,
        proofs: Arc<ProofGenerator>,
        transport: Arc<dyn HttpTransport>,
        session: Arc<AuthSession>,
    ) -> Self {
        Self {
            config,
            credentials,
            proofs,
            transport,
            session,
        }
    }

    /// Send an authenticated request. The response is returned whatever its
    /// status, after nonce and refresh recovery have been exhausted; callers
    /// that want typed decoding use `send_json`.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut refreshed = false;
        let mut nonce_retries = 0u32;

        loop {
            // Fresh proof and headers on every attempt
            let authed = self.with_auth_headers(request.clone())?;
            let response = self.transport.send(authed).await?;

            if let Some(nonce) = response.header(DPOP_NONCE_HEADER) {
                self.credentials.set_dpop_nonce(nonce);
            }

            let status = response.status.as_u16();
            if status == 401 || status == 403 {
                if nonce_retries < MAX_NONCE_RETRIES && wants_new_nonce(&response) {
                    nonce_retries += 1;
                    debug!(
                        attempt = nonce_retries,
                        "Server demanded a fresh DPoP nonce, retrying"
                    );
                    continue;
                }

                if status == 401 && !refreshed && self.credentials.refresh_token().is_some() {
                    refreshed = true;
                    info!(url = %request.url, "Access token rejected, refreshing");
                    self.session.refresh().await?;
                    continue;
                }
            }

            return Ok(response);
        }
    }

    /// Send and decode a JSON response body. Non-2xx statuses become typed
    /// errors.
    pub async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        let response = self.send(request).await?;
        if !response.is_success() {
            return Err(ApiError::from_status(response.status, &response.text()));
        }
        response.json()
    }

    /// Attach auth headers by credential precedence: DPoP-bound access
    /// token, bearer-only fallback when signing fails, legacy cookie when no
    /// token exists. No credentials at all is an immediate error, before any
    /// network traffic.
    fn with_auth_headers(&self, request: ApiRequest) -> Result<ApiRequest, ApiError> {
        let set = self.credentials.snapshot();

        if let Some(token) = set.access_token {
            let proof = self.proofs.generate(
                request.method.as_str(),
                &request.url,
                Some(&token),
                set.dpop_nonce.as_deref(),
            );
            return Ok(match proof {
                Ok(proof) => request
                    .header("DPoP", proof)
                    .header("Authorization", format!("DPoP {token}")),
                Err(e) => {
                    warn!(error = %e, "Proof generation failed, falling back to bearer auth");
                    request.header("Authorization", format!("Bearer {token}"))
                }
            });
        }

        if let Some(cookie) = set.session_cookie {
            return Ok(request.header(
                "Cookie",
                format!("{}={}", self.config.session_cookie_name, cookie),
            ));
        }

        Err(ApiError::NotAuthenticated)
    }
}

/// A 401/403 whose `WWW-Authenticate` challenge names `use_dpop_nonce` wants
/// the same request resent with the nonce we just captured.
fn wants_new_nonce(response: &ApiResponse) -> bool {
    response
        .header("www-authenticate")
        .is_some_and(|challenge| challenge.to_lowercase().contains("use_dpop_nonce"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::transport::testing::{json_response, response, with_header, MockTransport};
    use crate::storage::MemoryStore;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    use futures::FutureExt;
    use serde_json::json;

    const API_URL: &str = "https://www.streamgate.tv/api/feed";

    struct Fixture {
        executor: RequestExecutor,
        credentials: Arc<CredentialStore>,
        transport: Arc<MockTransport>,
    }

    fn fixture(transport: Arc<MockTransport>) -> Fixture {
        let config = ApiConfig::default();
        let credentials = Arc::new(CredentialStore::new(Arc::new(MemoryStore::new())));
        let proofs = Arc::new(ProofGenerator::new(Arc::clone(&credentials)));
        let session = Arc::new(AuthSession::new(
            config.clone(),
            Arc::clone(&credentials),
            Arc::clone(&proofs),
            Arc::clone(&transport) as Arc<dyn HttpTransport>,
        ));
        let executor = RequestExecutor::new(
            config,
            Arc::clone(&credentials),
            proofs,
            transport.clone() as Arc<dyn HttpTransport>,
            session,
        );
        Fixture {
            executor,
            credentials,
            transport,
        }
    }

    fn proof_claims(request: &ApiRequest) -> serde_json::Value {
        let proof = request.header_value("DPoP").unwrap();
        let claims = proof.split('.').nth(1).unwrap();
        serde_json::from_slice(&URL_SAFE_NO_PAD.decode(claims).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_send_attaches_dpop_headers() {
        let f = fixture(Arc::new(MockTransport::new(|_req, _n| {
            async { Ok(json_response(200, json!({"ok": true}))) }.boxed()
        })));
        f.credentials.store_tokens("tok", None, i64::MAX);

        let response = f.executor.send(ApiRequest::get(API_URL)).await.unwrap();
        assert!(response.is_success());

        let sent = &f.transport.requests()[0];
        assert_eq!(sent.header_value("Authorization"), Some("DPoP tok"));
        let claims = proof_claims(sent);
        assert_eq!(claims["htm"], "GET");
        assert_eq!(claims["htu"], API_URL);
        assert!(claims["ath"].is_string());
    }

    #[tokio::test]
    async fn test_send_uses_cookie_when_no_token() {
        let f = fixture(Arc::new(MockTransport::new(|_req, _n| {
            async { Ok(response(200, b"")) }.boxed()
        })));
        f.credentials.set_session_cookie(Some("legacy-value"));

        f.executor.send(ApiRequest::get(API_URL)).await.unwrap();

        let sent = &f.transport.requests()[0];
        assert_eq!(sent.header_value("Cookie"), Some("sg.sid=legacy-value"));
        assert!(sent.header_value("DPoP").is_none());
    }

    #[tokio::test]
    async fn test_send_without_credentials_fails_before_network() {
        let f = fixture(Arc::new(MockTransport::new(|_req, _n| {
            async { panic!("no request expected") }.boxed()
        })));

        let err = f.executor.send(ApiRequest::get(API_URL)).await.unwrap_err();
        assert!(matches!(err, ApiError::NotAuthenticated));
        assert_eq!(f.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_nonce_captured_and_echoed_in_next_proof() {
        let f = fixture(Arc::new(MockTransport::new(|_req, _n| {
            async {
                Ok(with_header(
                    response(200, b""),
                    "DPoP-Nonce",
                    "fresh-nonce",
                ))
            }
            .boxed()
        })));
        f.credentials.store_tokens("tok", None, i64::MAX);

        f.executor.send(ApiRequest::get(API_URL)).await.unwrap();
        f.executor.send(ApiRequest::get(API_URL)).await.unwrap();

        let requests = f.transport.requests();
        assert!(proof_claims(&requests[0]).get("nonce").is_none());
        assert_eq!(proof_claims(&requests[1])["nonce"], "fresh-nonce");
    }

    #[tokio::test]
    async fn test_use_dpop_nonce_challenge_retries_same_request() {
        let f = fixture(Arc::new(MockTransport::new(|_req, n| {
            async move {
                if n == 0 {
                    let challenged = with_header(
                        response(401, b""),
                        "WWW-Authenticate",
                        "DPoP error=\"use_dpop_nonce\"",
                    );
                    Ok(with_header(challenged, "DPoP-Nonce", "n-1"))
                } else {
                    Ok(response(200, b"payload"))
                }
            }
            .boxed()
        })));
        f.credentials.store_tokens("tok", None, i64::MAX);

        let resp = f.executor.send(ApiRequest::get(API_URL)).await.unwrap();
        assert!(resp.is_success());
        assert_eq!(f.transport.call_count(), 2);

        let retry = &f.transport.requests()[1];
        assert_eq!(proof_claims(retry)["nonce"], "n-1");
    }

    #[tokio::test]
    async fn test_nonce_retries_are_bounded() {
        let f = fixture(Arc::new(MockTransport::new(|_req, _n| {
            async {
                Ok(with_header(
                    with_header(response(401, b""), "DPoP-Nonce", "n"),
                    "WWW-Authenticate",
                    "DPoP error=\"use_dpop_nonce\"",
                ))
            }
            .boxed()
        })));
        f.credentials.store_tokens("tok", None, i64::MAX);

        // No refresh token, so after the bounded retries the 401 comes back
        let resp = f.executor.send(ApiRequest::get(API_URL)).await.unwrap();
        assert_eq!(resp.status.as_u16(), 401);
        assert_eq!(f.transport.call_count(), 1 + MAX_NONCE_RETRIES as usize);
    }

    #[tokio::test]
    async fn test_401_refreshes_once_and_retries() {
        let config = ApiConfig::default();
        let token_url = config.token_endpoint();
        let f = fixture(Arc::new(MockTransport::new(move |req, _n| {
            let is_token_endpoint = req.url == token_url;
            let authorization = req.header_value("Authorization").map(str::to_string);
            async move {
                if is_token_endpoint {
                    Ok(json_response(
                        200,
                        json!({"access_token": "tok-new", "expires_in": 3600}),
                    ))
                } else if authorization.as_deref() == Some("DPoP tok-new") {
                    Ok(response(200, b"payload"))
                } else {
                    Ok(response(401, b""))
                }
            }
            .boxed()
        })));
        f.credentials.store_tokens("tok-old", Some("rt"), i64::MAX);

        let resp = f.executor.send(ApiRequest::get(API_URL)).await.unwrap();
        assert!(resp.is_success());

        // One API 401, one refresh, one retried API call
        assert_eq!(f.transport.requests_to(API_URL).len(), 2);
        assert_eq!(
            f.transport
                .requests_to(&ApiConfig::default().token_endpoint())
                .len(),
            1
        );
        assert_eq!(f.credentials.access_token().as_deref(), Some("tok-new"));
    }

    #[tokio::test]
    async fn test_failed_refresh_surfaces_not_authenticated_and_clears() {
        let config = ApiConfig::default();
        let token_url = config.token_endpoint();
        let f = fixture(Arc::new(MockTransport::new(move |req, _n| {
            let is_token_endpoint = req.url == token_url;
            async move {
                if is_token_endpoint {
                    Ok(json_response(400, json!({"error": "invalid_grant"})))
                } else {
                    Ok(response(401, b""))
                }
            }
            .boxed()
        })));
        f.credentials.store_tokens("tok", Some("rt"), i64::MAX);

        let err = f.executor.send(ApiRequest::get(API_URL)).await.unwrap_err();
        assert!(matches!(err, ApiError::NotAuthenticated));

        // Credentials are gone: the next call fails with zero network traffic
        let before = f.transport.call_count();
        let err = f.executor.send(ApiRequest::get(API_URL)).await.unwrap_err();
        assert!(matches!(err, ApiError::NotAuthenticated));
        assert_eq!(f.transport.call_count(), before);
    }

    #[tokio::test]
    async fn test_plain_403_passes_through_without_refresh() {
        let f = fixture(Arc::new(MockTransport::new(|_req, _n| {
            async { Ok(response(403, b"forbidden")) }.boxed()
        })));
        f.credentials.store_tokens("tok", Some("rt"), i64::MAX);

        let resp = f.executor.send(ApiRequest::get(API_URL)).await.unwrap();
        assert_eq!(resp.status.as_u16(), 403);
        assert_eq!(f.transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_send_json_decodes_and_maps_errors() {
        #[derive(Debug, serde::Deserialize)]
        struct Feed {
            items: Vec<String>,
        }

        let f = fixture(Arc::new(MockTransport::new(|_req, n| {
            async move {
                if n == 0 {
                    Ok(json_response(200, json!({"items": ["a", "b"]})))
                } else {
                    Ok(response(503, b"maintenance"))
                }
            }
            .boxed()
        })));
        f.credentials.store_tokens("tok", None, i64::MAX);

        let feed: Feed = f.executor.send_json(ApiRequest::get(API_URL)).await.unwrap();
        assert_eq!(feed.items, vec!["a", "b"]);

        let err = f
            .executor
            .send_json::<Feed>(ApiRequest::get(API_URL))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::HttpError { status: 503, .. }));
    }
}
