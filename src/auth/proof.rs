//! DPoP proof generation (RFC 9449).
//!
//! Every authenticated request carries a freshly signed ES256 JWS binding
//! the request method and URL to this device's P-256 keypair. The keypair
//! is generated on first use and lives in the secure store; the public half
//! is embedded in each proof's header as a JWK.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::auth::credentials::CredentialStore;

/// JOSE type for DPoP proofs
const PROOF_TYP: &str = "dpop+jwt";

/// Signature algorithm; ES256 is the only one the service accepts
const PROOF_ALG: &str = "ES256";

#[derive(Serialize)]
struct ProofHeader<'a> {
    typ: &'a str,
    alg: &'a str,
    jwk: PublicJwk,
}

#[derive(Serialize)]
struct PublicJwk {
    kty: &'static str,
    crv: &'static str,
    x: String,
    y: String,
}

#[derive(Serialize)]
struct ProofClaims<'a> {
    /// Issue time in unix seconds, corrected by the learned clock offset
    iat: i64,
    /// Unique id so the server can reject replays
    jti: String,
    /// Uppercase HTTP method
    htm: &'a str,
    /// Target URL with query and fragment stripped
    htu: String,
    /// base64url(SHA-256(access token)), present when a token accompanies
    /// the request
    #[serde(skip_serializing_if = "Option::is_none")]
    ath: Option<String>,
    /// Most recent server-issued nonce, echoed back when known
    #[serde(skip_serializing_if = "Option::is_none")]
    nonce: Option<&'a str>,
}

pub struct ProofGenerator {
    credentials: Arc<CredentialStore>,
}

impl ProofGenerator {
    pub fn new(credentials: Arc<CredentialStore>) -> Self {
        Self { credentials }
    }

    /// Build a compact-serialized proof for one request. Sync by contract:
    /// callers sign on the request path without awaiting.
    pub fn generate(
        &self,
        method: &str,
        url: &str,
        access_token: Option<&str>,
        nonce: Option<&str>,
    ) -> Result<String, ApiError> {
        let signing_key = self.signing_key()?;
        let htu = Self::htu_for(url)?;

        let point = signing_key.verifying_key().to_encoded_point(false);
        let (x, y) = match (point.x(), point.y()) {
            (Some(x), Some(y)) => (x, y),
            _ => {
                return Err(ApiError::SigningError(
                    "public key has no affine coordinates".to_string(),
                ))
            }
        };

        let header = ProofHeader {
            typ: PROOF_TYP,
            alg: PROOF_ALG,
            jwk: PublicJwk {
                kty: "EC",
                crv: "P-256",
                x: URL_SAFE_NO_PAD.encode(x),
                y: URL_SAFE_NO_PAD.encode(y),
            },
        };

        let claims = ProofClaims {
            iat: Utc::now().timestamp() + self.credentials.clock_offset_seconds(),
            jti: Uuid::new_v4().to_string(),
            htm: method,
            htu,
            ath: access_token.map(|token| {
                let digest = Sha256::digest(token.as_bytes());
                URL_SAFE_NO_PAD.encode(digest)
            }),
            nonce,
        };

        let header_b64 = Self::encode_part(&header)?;
        let claims_b64 = Self::encode_part(&claims)?;
        let signing_input = format!("{header_b64}.{claims_b64}");

        let signature: Signature = signing_key.sign(signing_input.as_bytes());
        // Raw r||s (64 bytes), not DER
        let signature_b64 = URL_SAFE_NO_PAD.encode(signature.to_bytes());

        Ok(format!("{signing_input}.{signature_b64}"))
    }

    /// The `htu` claim: the request URL minus query and fragment.
    fn htu_for(url: &str) -> Result<String, ApiError> {
        let mut parsed = reqwest::Url::parse(url)
            .map_err(|e| ApiError::InvalidUrl(format!("{url}: {e}")))?;
        parsed.set_query(None);
        parsed.set_fragment(None);
        Ok(parsed.to_string())
    }

    fn signing_key(&self) -> Result<SigningKey, ApiError> {
        let bytes = self.credentials.get_or_create_signing_key(|| {
            SigningKey::random(&mut rand::rngs::OsRng)
                .to_bytes()
                .to_vec()
        })?;
        SigningKey::from_slice(&bytes)
            .map_err(|e| ApiError::SigningError(format!("stored signing key is invalid: {e}")))
    }

    fn encode_part<T: Serialize>(part: &T) -> Result<String, ApiError> {
        let json = serde_json::to_vec(part)
            .map_err(|e| ApiError::SigningError(format!("failed to serialize proof: {e}")))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }
}
