//! Secure media delivery through the custom-scheme interceptor.

pub mod interceptor;

pub use interceptor::{ResourceResolver, SecureManifestInterceptor, MEDIA_URL_SCHEME};
