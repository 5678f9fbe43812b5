//! Endpoint and client configuration.
//!
//! `ApiConfig` carries the base URLs and OAuth client settings for a
//! Streamgate deployment. `Default` points at production; tests and staging
//! builds construct their own.

use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Production authorization server (Keycloak realm host)
const DEFAULT_AUTH_BASE_URL: &str = "https://auth.streamgate.tv";

/// Production API host
const DEFAULT_API_BASE_URL: &str = "https://www.streamgate.tv";

/// Production companion service host
const DEFAULT_COMPANION_BASE_URL: &str = "https://companion.streamgate.tv";

/// OAuth client id registered for native clients
const DEFAULT_CLIENT_ID: &str = "streamgate-native";

/// Scopes requested on every grant. `offline_access` gets us a refresh token.
const DEFAULT_SCOPE: &str = "openid offline_access";

/// Cookie name used by the legacy session-cookie auth path
const DEFAULT_SESSION_COOKIE_NAME: &str = "sg.sid";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub auth_base_url: String,
    pub api_base_url: String,
    pub companion_base_url: String,
    pub client_id: String,
    pub scope: String,
    pub session_cookie_name: String,
    pub user_agent: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            auth_base_url: DEFAULT_AUTH_BASE_URL.to_string(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            companion_base_url: DEFAULT_COMPANION_BASE_URL.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            scope: DEFAULT_SCOPE.to_string(),
            session_cookie_name: DEFAULT_SESSION_COOKIE_NAME.to_string(),
            user_agent: format!("streamgate/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ApiConfig {
    /// OAuth token endpoint (all grant types, including device-code polling)
    pub fn token_endpoint(&self) -> String {
        format!(
            "{}/realms/streamgate/protocol/openid-connect/token",
            self.auth_base_url
        )
    }

    /// Device authorization endpoint (starts the TV login flow)
    pub fn device_endpoint(&self) -> String {
        format!(
            "{}/realms/streamgate/protocol/openid-connect/auth/device",
            self.auth_base_url
        )
    }

    /// RP-initiated logout endpoint
    pub fn logout_endpoint(&self) -> String {
        format!(
            "{}/realms/streamgate/protocol/openid-connect/logout",
            self.auth_base_url
        )
    }

    /// Companion service registration endpoint
    pub fn companion_register_endpoint(&self) -> String {
        format!("{}/auth/register", self.companion_base_url)
    }

    /// Identity endpoint the companion registration proof is bound to
    pub fn identity_url(&self) -> String {
        format!("{}/api/user/self", self.api_base_url)
    }
}
