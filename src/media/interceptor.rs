//! Secure media delivery.
//!
//! HLS players are pointed at URLs rewritten to a custom scheme so every
//! manifest and key request is delegated back to us instead of fetched
//! directly. `SecureManifestInterceptor` restores the real URL, fetches it
//! with the device's auth headers, and for manifests rewrites the content so
//! nested key URIs keep flowing through the interceptor while media segments
//! go straight to the CDN.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Url;
use tracing::{debug, warn};

use crate::api::error::ApiError;
use crate::api::transport::{ApiRequest, HttpTransport, DPOP_NONCE_HEADER};
use crate::auth::credentials::CredentialStore;
use crate::auth::proof::ProofGenerator;
use crate::config::ApiConfig;

/// Scheme registered with the player so resource loading is delegated to us
pub const MEDIA_URL_SCHEME: &str = "streamgate";

/// What a delegated URL points at, by path heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResourceKind {
    /// `.m3u8` playlist: fetch authenticated, rewrite before returning
    Manifest,
    /// AES key material: fetch authenticated, return raw
    Key,
    /// Anything else that ended up delegated: fetch authenticated, return
    /// raw, so playback degrades gracefully instead of stalling
    Other,
}

/// Resolves a player-delegated URL to response bytes.
#[async_trait]
pub trait ResourceResolver: Send + Sync {
    async fn resolve(&self, url: &str) -> Result<Vec<u8>, ApiError>;
}

pub struct SecureManifestInterceptor {
    config: ApiConfig,
    credentials: Arc<CredentialStore>,
    proofs: Arc<ProofGenerator>,
    transport: Arc<dyn HttpTransport>,
}

impl SecureManifestInterceptor {
    pub fn new(
        config: ApiConfig,
        credentials: Arc<CredentialStore>,
        proofs: Arc<ProofGenerator>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            config,
            credentials,
            proofs,
            transport,
        }
    }

    /// Rewrite an https media URL to the custom scheme before handing it to
    /// the player.
    pub fn wrap_url(url: &str) -> Result<String, ApiError> {
        let parsed = Url::parse(url).map_err(|e| ApiError::InvalidUrl(format!("{url}: {e}")))?;
        match parsed.scheme() {
            "http" | "https" => Ok(swap_scheme(parsed.as_str(), MEDIA_URL_SCHEME)),
            other => Err(ApiError::InvalidUrl(format!(
                "cannot wrap {other} URL: {url}"
            ))),
        }
    }

    /// Fetch a URL with whatever auth we hold: DPoP-bound token first,
    /// bearer if signing fails, legacy cookie as last resort. Media fetches
    /// bypass the refresh machinery; a failure fails only this request.
    async fn fetch_authenticated(&self, url: &Url) -> Result<Vec<u8>, ApiError> {
        let mut request = ApiRequest::get(url.as_str());
        let set = self.credentials.snapshot();

        if let Some(token) = set.access_token {
            match self
                .proofs
                .generate("GET", url.as_str(), Some(&token), set.dpop_nonce.as_deref())
            {
                Ok(proof) => {
                    request = request
                        .header("DPoP", proof)
                        .header("Authorization", format!("DPoP {token}"));
                }
                Err(e) => {
                    warn!(error = %e, "Proof generation failed, falling back to bearer auth");
                    request = request.header("Authorization", format!("Bearer {token}"));
                }
            }
        } else if let Some(cookie) = set.session_cookie {
            request = request.header(
                "Cookie",
                format!("{}={}", self.config.session_cookie_name, cookie),
            );
        }

        let response = self.transport.send(request).await?;
        if let Some(nonce) = response.header(DPOP_NONCE_HEADER) {
            self.credentials.set_dpop_nonce(nonce);
        }
        if !response.is_success() {
            return Err(ApiError::from_status(response.status, &response.text()));
        }
        Ok(response.body)
    }
}

#[async_trait]
impl ResourceResolver for SecureManifestInterceptor {
    async fn resolve(&self, url: &str) -> Result<Vec<u8>, ApiError> {
        let target = unwrap_url(url)?;
        let kind = classify(&target);
        debug!(url = %target, ?kind, "Resolving delegated media resource");

        let body = self.fetch_authenticated(&target).await?;
        match kind {
            ResourceKind::Manifest => {
                let manifest = String::from_utf8(body)
                    .map_err(|_| ApiError::MalformedData("manifest is not UTF-8".to_string()))?;
                Ok(rewrite_manifest(&manifest, &target).into_bytes())
            }
            ResourceKind::Key | ResourceKind::Other => Ok(body),
        }
    }
}

// ============================================================================
// URL plumbing
// ============================================================================

/// Custom-scheme URL back to its https form. Plain http(s) URLs pass
/// through, so the resolver also works when a player skips the wrapping.
fn unwrap_url(url: &str) -> Result<Url, ApiError> {
    let prefix = format!("{MEDIA_URL_SCHEME}://");
    let https = match url.strip_prefix(&prefix) {
        Some(rest) => format!("https://{rest}"),
        None => url.to_string(),
    };
    Url::parse(&https).map_err(|e| ApiError::InvalidUrl(format!("{url}: {e}")))
}

/// Replace a URL's scheme textually. `Url::set_scheme` refuses to move
/// between special and non-special schemes, so this works on the string.
fn swap_scheme(url: &str, scheme: &str) -> String {
    match url.split_once("://") {
        Some((_, rest)) => format!("{scheme}://{rest}"),
        None => url.to_string(),
    }
}

fn classify(url: &Url) -> ResourceKind {
    let path = url.path().to_lowercase();
    if path.ends_with(".m3u8") {
        ResourceKind::Manifest
    } else if path.ends_with(".key") || path.contains("key") {
        ResourceKind::Key
    } else {
        ResourceKind::Other
    }
}

// ============================================================================
// Manifest rewriting
// ============================================================================

/// Rewrite a playlist line by line:
/// - key directives get their URI resolved against the manifest URL and
///   swapped to the custom scheme, so key fetches come back through us
/// - bare resource lines (segments, nested playlists) become absolute https
///   URLs so the player fetches them directly
/// - everything else passes through byte-for-byte, CRLF included
fn rewrite_manifest(manifest: &str, base: &Url) -> String {
    let mut out = String::with_capacity(manifest.len());
    let mut first = true;

    for raw in manifest.split('\n') {
        if !first {
            out.push('\n');
        }
        first = false;

        let (line, cr) = match raw.strip_suffix('\r') {
            Some(line) => (line, "\r"),
            None => (raw, ""),
        };

        if line.contains("#EXT-X-KEY") && line.contains("URI=\"") {
            out.push_str(&rewrite_key_line(line, base));
        } else if !line.is_empty() && !line.starts_with('#') {
            match base.join(line) {
                Ok(absolute) => out.push_str(absolute.as_str()),
                Err(_) => out.push_str(line),
            }
        } else {
            out.push_str(line);
        }
        out.push_str(cr);
    }

    out
}

fn rewrite_key_line(line: &str, base: &Url) -> String {
    let Some(attr) = line.find("URI=\"") else {
        return line.to_string();
    };
    let uri_start = attr + "URI=\"".len();
    let Some(uri_len) = line[uri_start..].find('"') else {
        return line.to_string();
    };

    let original = &line[uri_start..uri_start + uri_len];
    match base.join(original) {
        Ok(absolute) => {
            let wrapped = swap_scheme(absolute.as_str(), MEDIA_URL_SCHEME);
            format!(
                "{}{}{}",
                &line[..uri_start],
                wrapped,
                &line[uri_start + uri_len..]
            )
        }
        Err(e) => {
            warn!(uri = original, error = %e, "Unresolvable key URI left untouched");
            line.to_string()
        }
    }
}
