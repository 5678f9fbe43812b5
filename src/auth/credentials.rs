//! Typed credential access over the secure store.
//!
//! `CredentialStore` keeps an in-memory copy of every credential field,
//! loaded once at startup, and writes through to the backing `SecureStore`
//! on every mutation. Reads never touch the keyring after startup, so the
//! sync accessors are cheap enough to call on every request. Concurrent
//! writes are last-writer-wins under a single lock, which also makes
//! multi-field updates (token rotation, logout) atomic with respect to
//! readers.

use std::sync::{Arc, Mutex, RwLock};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use tracing::{debug, warn};

use crate::api::error::ApiError;
use crate::storage::SecureStore;

// ============================================================================
// Storage keys
// ============================================================================

const KEY_ACCESS_TOKEN: &str = "access_token";
const KEY_REFRESH_TOKEN: &str = "refresh_token";
const KEY_TOKEN_EXPIRY: &str = "token_expiry";
const KEY_SESSION_COOKIE: &str = "session_cookie";
const KEY_COMPANION_API_KEY: &str = "companion_api_key";
const KEY_DPOP_NONCE: &str = "dpop_nonce";
const KEY_CLOCK_OFFSET: &str = "clock_offset";
const KEY_SIGNING_KEY: &str = "dpop_private_key";

/// Seconds before actual expiry at which a token is reported expired, so
/// callers refresh before the server starts rejecting it.
const EXPIRY_BUFFER_SECS: i64 = 60;

/// Snapshot of everything needed to authenticate a request.
#[derive(Debug, Clone, Default)]
pub struct CredentialSet {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    /// Unix seconds at which the access token expires
    pub expires_at: Option<i64>,
    /// Legacy session cookie value, used only when no OAuth tokens exist
    pub session_cookie: Option<String>,
    pub companion_api_key: Option<String>,
    /// Most recent server-issued DPoP nonce
    pub dpop_nonce: Option<String>,
    /// Server unix time minus device unix time, learned from clock-skew
    /// rejections. Applied to every proof's `iat`.
    pub clock_offset_seconds: i64,
}

pub struct CredentialStore {
    store: Arc<dyn SecureStore>,
    cached: RwLock<CredentialSet>,
    // Guards check-then-create of the signing key so it is written at most
    // once even when two tasks race to generate their first proof.
    key_lock: Mutex<()>,
}

impl CredentialStore {
    /// Load all credential fields from the store. Individual read failures
    /// are tolerated (the field is treated as absent) so a keyring hiccup
    /// degrades to "not authenticated" rather than a startup failure.
    pub fn new(store: Arc<dyn SecureStore>) -> Self {
        let read = |key: &str| match store.get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "Failed to read credential from store");
                None
            }
        };

        let cached = CredentialSet {
            access_token: read(KEY_ACCESS_TOKEN),
            refresh_token: read(KEY_REFRESH_TOKEN),
            expires_at: read(KEY_TOKEN_EXPIRY).and_then(|v| v.parse().ok()),
            session_cookie: read(KEY_SESSION_COOKIE),
            companion_api_key: read(KEY_COMPANION_API_KEY),
            dpop_nonce: read(KEY_DPOP_NONCE),
            clock_offset_seconds: read(KEY_CLOCK_OFFSET)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        };

        debug!(
            has_access_token = cached.access_token.is_some(),
            has_refresh_token = cached.refresh_token.is_some(),
            has_cookie = cached.session_cookie.is_some(),
            clock_offset = cached.clock_offset_seconds,
            "Loaded credentials"
        );

        Self {
            store,
            cached: RwLock::new(cached),
            key_lock: Mutex::new(()),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn snapshot(&self) -> CredentialSet {
        self.cached.read().unwrap().clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.cached.read().unwrap().access_token.clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.cached.read().unwrap().refresh_token.clone()
    }

    pub fn session_cookie(&self) -> Option<String> {
        self.cached.read().unwrap().session_cookie.clone()
    }

    pub fn companion_api_key(&self) -> Option<String> {
        self.cached.read().unwrap().companion_api_key.clone()
    }

    pub fn dpop_nonce(&self) -> Option<String> {
        self.cached.read().unwrap().dpop_nonce.clone()
    }

    pub fn clock_offset_seconds(&self) -> i64 {
        self.cached.read().unwrap().clock_offset_seconds
    }

    /// True when there is no usable credential of either kind.
    pub fn is_empty(&self) -> bool {
        let set = self.cached.read().unwrap();
        set.access_token.is_none() && set.session_cookie.is_none()
    }

    /// True when the access token is missing or within the refresh buffer
    /// of its recorded expiry.
    pub fn is_token_expired(&self, now_unix: i64) -> bool {
        let set = self.cached.read().unwrap();
        if set.access_token.is_none() {
            return true;
        }
        match set.expires_at {
            Some(expires_at) => now_unix >= expires_at - EXPIRY_BUFFER_SECS,
            // No recorded expiry: assume still valid, the 401 path covers us
            None => false,
        }
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Store a token grant atomically. A missing `refresh_token` keeps the
    /// previous one (the server only rotates it sometimes).
    pub fn store_tokens(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: i64,
    ) {
        let mut set = self.cached.write().unwrap();
        set.access_token = Some(access_token.to_string());
        set.expires_at = Some(expires_at);
        if let Some(refresh) = refresh_token {
            set.refresh_token = Some(refresh.to_string());
        }

        self.persist(KEY_ACCESS_TOKEN, Some(access_token));
        self.persist(KEY_TOKEN_EXPIRY, Some(&expires_at.to_string()));
        if let Some(refresh) = refresh_token {
            self.persist(KEY_REFRESH_TOKEN, Some(refresh));
        }
    }

    pub fn set_session_cookie(&self, cookie: Option<&str>) {
        self.cached.write().unwrap().session_cookie = cookie.map(str::to_string);
        self.persist(KEY_SESSION_COOKIE, cookie);
    }

    pub fn set_companion_api_key(&self, api_key: Option<&str>) {
        self.cached.write().unwrap().companion_api_key = api_key.map(str::to_string);
        self.persist(KEY_COMPANION_API_KEY, api_key);
    }

    pub fn set_dpop_nonce(&self, nonce: &str) {
        let mut set = self.cached.write().unwrap();
        if set.dpop_nonce.as_deref() == Some(nonce) {
            return;
        }
        set.dpop_nonce = Some(nonce.to_string());
        drop(set);
        self.persist(KEY_DPOP_NONCE, Some(nonce));
    }

    pub fn set_clock_offset_seconds(&self, offset: i64) {
        self.cached.write().unwrap().clock_offset_seconds = offset;
        self.persist(KEY_CLOCK_OFFSET, Some(&offset.to_string()));
    }

    /// Drop the OAuth token set after an unrecoverable refresh failure.
    /// The legacy cookie (if any) survives so cookie-based access keeps
    /// working.
    pub fn clear_oauth_tokens(&self) {
        let mut set = self.cached.write().unwrap();
        set.access_token = None;
        set.refresh_token = None;
        set.expires_at = None;
        drop(set);

        self.persist(KEY_ACCESS_TOKEN, None);
        self.persist(KEY_REFRESH_TOKEN, None);
        self.persist(KEY_TOKEN_EXPIRY, None);
    }

    /// Full logout: every session credential goes. The signing key and the
    /// learned clock offset are device properties and survive.
    pub fn clear_session(&self) {
        let mut set = self.cached.write().unwrap();
        let offset = set.clock_offset_seconds;
        *set = CredentialSet {
            clock_offset_seconds: offset,
            ..CredentialSet::default()
        };
        drop(set);

        for key in [
            KEY_ACCESS_TOKEN,
            KEY_REFRESH_TOKEN,
            KEY_TOKEN_EXPIRY,
            KEY_SESSION_COOKIE,
            KEY_COMPANION_API_KEY,
            KEY_DPOP_NONCE,
        ] {
            self.persist(key, None);
        }
    }

    // ========================================================================
    // Signing key
    // ========================================================================

    /// Fetch the device signing key, generating and persisting it on first
    /// use. `generate` produces the raw private scalar bytes. The lock makes
    /// the write happen at most once across racing callers.
    pub fn get_or_create_signing_key<F>(&self, generate: F) -> Result<Vec<u8>, ApiError>
    where
        F: FnOnce() -> Vec<u8>,
    {
        let _guard = self.key_lock.lock().unwrap();

        match self.store.get(KEY_SIGNING_KEY) {
            Ok(Some(encoded)) => {
                if let Ok(bytes) = URL_SAFE_NO_PAD.decode(&encoded) {
                    return Ok(bytes);
                }
                warn!("Stored signing key is not valid base64, regenerating");
            }
            Ok(None) => {}
            Err(e) => {
                return Err(ApiError::SigningError(format!(
                    "failed to read signing key: {e}"
                )))
            }
        }

        let bytes = generate();
        self.store
            .set(KEY_SIGNING_KEY, &URL_SAFE_NO_PAD.encode(&bytes))
            .map_err(|e| ApiError::SigningError(format!("failed to persist signing key: {e}")))?;
        debug!("Generated new device signing key");
        Ok(bytes)
    }

    /// Best-effort write-through. The cache is authoritative for the running
    /// process; a store failure costs persistence across restarts, not
    /// correctness now.
    fn persist(&self, key: &str, value: Option<&str>) {
        let result = match value {
            Some(v) => self.store.set(key, v),
            None => self.store.delete(key),
        };
        if let Err(e) = result {
            warn!(key, error = %e, "Failed to persist credential");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn fresh() -> CredentialStore {
        CredentialStore::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_store_tokens_keeps_old_refresh_token_when_absent() {
        let creds = fresh();
        creds.store_tokens("at1", Some("rt1"), 1000);
        creds.store_tokens("at2", None, 2000);

        let set = creds.snapshot();
        assert_eq!(set.access_token.as_deref(), Some("at2"));
        assert_eq!(set.refresh_token.as_deref(), Some("rt1"));
        assert_eq!(set.expires_at, Some(2000));
    }

    #[test]
    fn test_credentials_survive_reload_from_store() {
        let store: Arc<dyn SecureStore> = Arc::new(MemoryStore::new());
        {
            let creds = CredentialStore::new(Arc::clone(&store));
            creds.store_tokens("at", Some("rt"), 99);
            creds.set_clock_offset_seconds(-42);
            creds.set_dpop_nonce("n1");
        }
        let reloaded = CredentialStore::new(store);
        let set = reloaded.snapshot();
        assert_eq!(set.access_token.as_deref(), Some("at"));
        assert_eq!(set.expires_at, Some(99));
        assert_eq!(set.clock_offset_seconds, -42);
        assert_eq!(set.dpop_nonce.as_deref(), Some("n1"));
    }

    #[test]
    fn test_is_token_expired_applies_buffer() {
        let creds = fresh();
        assert!(creds.is_token_expired(0), "no token at all");

        creds.store_tokens("at", None, 1000);
        assert!(!creds.is_token_expired(1000 - EXPIRY_BUFFER_SECS - 1));
        assert!(creds.is_token_expired(1000 - EXPIRY_BUFFER_SECS));
        assert!(creds.is_token_expired(1001));
    }

    #[test]
    fn test_clear_oauth_tokens_keeps_cookie() {
        let creds = fresh();
        creds.store_tokens("at", Some("rt"), 1000);
        creds.set_session_cookie(Some("legacy"));

        creds.clear_oauth_tokens();
        let set = creds.snapshot();
        assert!(set.access_token.is_none());
        assert!(set.refresh_token.is_none());
        assert!(set.expires_at.is_none());
        assert_eq!(set.session_cookie.as_deref(), Some("legacy"));
    }

    #[test]
    fn test_clear_session_keeps_clock_offset() {
        let creds = fresh();
        creds.store_tokens("at", Some("rt"), 1000);
        creds.set_session_cookie(Some("legacy"));
        creds.set_companion_api_key(Some("ck"));
        creds.set_clock_offset_seconds(7);

        creds.clear_session();
        let set = creds.snapshot();
        assert!(set.access_token.is_none());
        assert!(set.session_cookie.is_none());
        assert!(set.companion_api_key.is_none());
        assert!(set.dpop_nonce.is_none());
        assert_eq!(set.clock_offset_seconds, 7);
    }

    #[test]
    fn test_signing_key_generated_once() {
        let creds = fresh();
        let first = creds.get_or_create_signing_key(|| vec![1u8; 32]).unwrap();
        let second = creds.get_or_create_signing_key(|| vec![2u8; 32]).unwrap();
        assert_eq!(first, second);
    }
}
