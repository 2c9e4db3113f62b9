//! Credential validation
//!
//! The broker treats validation as an opaque external call. [`FormatValidator`]
//! is the built-in implementation used by the binary: it checks that the
//! credentials are well formed and that a token has not expired, and nothing
//! more. Deployments that talk to a real auth service plug in their own
//! [`CredentialValidator`].

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use futures::future::BoxFuture;
use std::sync::Arc;

use crate::types::Credentials;

/// Result of a validation call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// Credentials accepted
    Accepted,
    /// Credentials refused, with a reason for logs
    Rejected(String),
}

impl ValidationOutcome {
    /// Create a rejection
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }

    /// Whether the credentials were accepted
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// External credential validator
///
/// Object safe so the broker can hold an `Arc<dyn CredentialValidator>`.
pub trait CredentialValidator: Send + Sync {
    /// Validate a credential pair
    fn validate<'a>(&'a self, credentials: &'a Credentials) -> BoxFuture<'a, ValidationOutcome>;
}

/// Closure type accepted by [`ValidatorFn`]
pub type ValidatorCallback =
    Arc<dyn Fn(Credentials) -> BoxFuture<'static, ValidationOutcome> + Send + Sync>;

/// Validator backed by an async closure
#[derive(Clone)]
pub struct ValidatorFn(ValidatorCallback);

impl ValidatorFn {
    /// Create a validator from a closure
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Credentials) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ValidationOutcome> + Send + 'static,
    {
        Self(Arc::new(move |credentials| Box::pin(f(credentials))))
    }
}

impl CredentialValidator for ValidatorFn {
    fn validate<'a>(&'a self, credentials: &'a Credentials) -> BoxFuture<'a, ValidationOutcome> {
        (self.0)(credentials.clone())
    }
}

impl std::fmt::Debug for ValidatorFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ValidatorFn")
    }
}

/// Structural validator for API keys and JWT access tokens
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatValidator;

impl FormatValidator {
    /// Create a format validator
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Synchronous check shared by the trait impl
    #[must_use]
    pub fn check(&self, credentials: &Credentials) -> ValidationOutcome {
        let api_key = credentials.api_key.as_deref().filter(|k| !k.is_empty());
        let token = credentials.access_token.as_deref().filter(|t| !t.is_empty());

        if api_key.is_none() && token.is_none() {
            return ValidationOutcome::rejected("no credentials supplied");
        }
        if let Some(key) = api_key
            && !is_api_key(key)
        {
            return ValidationOutcome::rejected("malformed API key");
        }
        if let Some(token) = token
            && let Err(reason) = check_jwt(token, chrono::Utc::now().timestamp())
        {
            return ValidationOutcome::Rejected(reason);
        }
        ValidationOutcome::Accepted
    }
}

impl CredentialValidator for FormatValidator {
    fn validate<'a>(&'a self, credentials: &'a Credentials) -> BoxFuture<'a, ValidationOutcome> {
        let outcome = self.check(credentials);
        Box::pin(async move { outcome })
    }
}

/// `app.key:secret`
fn is_api_key(key: &str) -> bool {
    let Some((name, secret)) = key.split_once(':') else {
        return false;
    };
    let Some((app, key_id)) = name.split_once('.') else {
        return false;
    };
    !app.is_empty() && !key_id.is_empty() && !secret.is_empty()
}

fn decode_segment(segment: &str) -> Option<serde_json::Map<String, serde_json::Value>> {
    let bytes = URL_SAFE_NO_PAD.decode(segment.trim_end_matches('=')).ok()?;
    match serde_json::from_slice::<serde_json::Value>(&bytes).ok()? {
        serde_json::Value::Object(map) => Some(map),
        _ => None,
    }
}

fn check_jwt(token: &str, now_secs: i64) -> std::result::Result<(), String> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 || segments.iter().any(|s| s.is_empty()) {
        return Err("Invalid token: expected three JWT segments".to_string());
    }

    let header = decode_segment(segments[0])
        .ok_or_else(|| "Invalid token: header is not base64url JSON".to_string())?;
    if !header.get("alg").is_some_and(serde_json::Value::is_string) {
        return Err("Invalid token: header has no algorithm".to_string());
    }

    let payload = decode_segment(segments[1])
        .ok_or_else(|| "Invalid token: payload is not base64url JSON".to_string())?;
    if let Some(exp) = payload.get("exp").and_then(serde_json::Value::as_i64)
        && exp <= now_secs
    {
        return Err("Invalid token: expired".to_string());
    }

    Ok(())
}
