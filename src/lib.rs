//! Streamgate client core.
//!
//! Everything a Streamgate client app needs to authenticate and play
//! protected media: the OAuth device flow with DPoP-bound tokens, secure
//! credential storage, an authenticated request executor with transparent
//! nonce and refresh recovery, and the HLS manifest interceptor that keeps
//! key fetches authenticated.
//!
//! `Streamgate::new` wires the pieces together over the OS keyring and a
//! shared HTTP client; apps that need finer control construct the parts
//! directly.

pub mod api;
pub mod auth;
pub mod config;
pub mod media;
pub mod storage;

use std::sync::Arc;

pub use api::{
    ApiError, ApiRequest, ApiResponse, HttpTransport, RequestExecutor, ReqwestTransport,
};
pub use auth::{AuthSession, CredentialStore, DeviceFlowSession, DeviceFlowState, ProofGenerator};
pub use config::ApiConfig;
pub use media::{ResourceResolver, SecureManifestInterceptor, MEDIA_URL_SCHEME};
pub use storage::{KeyringStore, MemoryStore, SecureStore};

/// The assembled client stack.
/// Clone is cheap - every component is behind an Arc.
#[derive(Clone)]
pub struct Streamgate {
    session: Arc<AuthSession>,
    executor: Arc<RequestExecutor>,
    interceptor: Arc<SecureManifestInterceptor>,
    credentials: Arc<CredentialStore>,
}

impl Streamgate {
    /// Build the production stack: OS keyring storage and a pooled HTTP
    /// client.
    pub fn new(config: ApiConfig) -> Result<Self, ApiError> {
        let store: Arc<dyn SecureStore> = Arc::new(KeyringStore::new());
        let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new(&config)?);
        Ok(Self::with_parts(config, store, transport))
    }

    /// Build the stack over explicit storage and transport.
    pub fn with_parts(
        config: ApiConfig,
        store: Arc<dyn SecureStore>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        let credentials = Arc::new(CredentialStore::new(store));
        let proofs = Arc::new(ProofGenerator::new(Arc::clone(&credentials)));
        let session = Arc::new(AuthSession::new(
            config.clone(),
            Arc::clone(&credentials),
            Arc::clone(&proofs),
            Arc::clone(&transport),
        ));
        let executor = Arc::new(RequestExecutor::new(
            config.clone(),
            Arc::clone(&credentials),
            Arc::clone(&proofs),
            Arc::clone(&transport),
            Arc::clone(&session),
        ));
        let interceptor = Arc::new(SecureManifestInterceptor::new(
            config,
            Arc::clone(&credentials),
            proofs,
            transport,
        ));

        Self {
            session,
            executor,
            interceptor,
            credentials,
        }
    }

    pub fn session(&self) -> &Arc<AuthSession> {
        &self.session
    }

    pub fn executor(&self) -> &Arc<RequestExecutor> {
        &self.executor
    }

    pub fn interceptor(&self) -> &Arc<SecureManifestInterceptor> {
        &self.interceptor
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }
}
