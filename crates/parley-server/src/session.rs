//! Signed session tokens.
//!
//! A token binds an opaque value (the user id) to an HMAC-SHA256 signature
//! under a process-wide secret:
//!
//! ```text
//! base64url(value) | base64url(HMAC-SHA256(secret, value))
//! ```
//!
//! The delimiter never appears in the URL-safe base64 alphabet, so a valid
//! token always splits into exactly two components. Signature comparison
//! goes through [`Mac::verify_slice`], which is constant-time.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use hmac::{Hmac, Mac};
use parley_types::UserId;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Separator between the encoded value and the encoded signature.
pub const TOKEN_DELIMITER: char = '|';

/// Reasons a session token fails verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
    /// The token does not split into exactly two components.
    #[error("malformed session token")]
    Malformed,
    /// A component is not valid base64url, or the value is not UTF-8.
    #[error("session token has an invalid encoding")]
    BadEncoding,
    /// The signature does not match the value under the current secret.
    #[error("session token signature mismatch")]
    BadSignature,
}

/// Errors constructing a [`SessionCodec`].
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("session secret must not be empty")]
    Empty,
}

/// Signs and verifies session tokens under one secret.
///
/// Cheap to clone; the keyed MAC state is copied per operation.
#[derive(Clone)]
pub struct SessionCodec {
    mac: HmacSha256,
}

impl std::fmt::Debug for SessionCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCodec").finish_non_exhaustive()
    }
}

impl SessionCodec {
    /// Creates a codec keyed with `secret`.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::Empty`] for an empty secret.
    pub fn new(secret: &[u8]) -> Result<Self, SecretError> {
        if secret.is_empty() {
            return Err(SecretError::Empty);
        }
        // HMAC accepts keys of any length; the only rejection is ours above.
        let mac = HmacSha256::new_from_slice(secret).map_err(|_| SecretError::Empty)?;
        Ok(Self { mac })
    }

    /// Produces a signed token for `value`. Deterministic for a given secret.
    pub fn sign(&self, value: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(value.as_bytes());
        let signature = mac.finalize().into_bytes();

        format!(
            "{}{}{}",
            URL_SAFE.encode(value.as_bytes()),
            TOKEN_DELIMITER,
            URL_SAFE.encode(signature)
        )
    }

    /// Verifies `token` and returns the value it was signed over.
    ///
    /// # Errors
    ///
    /// - [`TokenError::Malformed`] unless the token has exactly two components.
    /// - [`TokenError::BadEncoding`] if either component fails to decode.
    /// - [`TokenError::BadSignature`] if the signature does not match.
    pub fn verify(&self, token: &str) -> Result<String, TokenError> {
        let mut parts = token.split(TOKEN_DELIMITER);
        let (Some(value_b64), Some(signature_b64), None) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Malformed);
        };

        let value = URL_SAFE
            .decode(value_b64)
            .map_err(|_| TokenError::BadEncoding)?;
        let signature = URL_SAFE
            .decode(signature_b64)
            .map_err(|_| TokenError::BadEncoding)?;

        let mut mac = self.mac.clone();
        mac.update(&value);
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        String::from_utf8(value).map_err(|_| TokenError::BadEncoding)
    }

    /// Signs a session for `user_id`.
    pub fn sign_user(&self, user_id: UserId) -> String {
        self.sign(&user_id.to_string())
    }

    /// Verifies a session token and parses the user id it carries.
    ///
    /// A correctly signed value that is not a user id is reported as
    /// [`TokenError::Malformed`].
    pub fn verify_user(&self, token: &str) -> Result<UserId, TokenError> {
        self.verify(token)?
            .parse()
            .map_err(|_| TokenError::Malformed)
    }
}

/// Extracts a cookie value from a `Cookie` header.
///
/// Returns `None` when the cookie is absent or empty.
pub fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    let prefix = format!("{}=", name);
    header
        .split(';')
        .filter_map(|cookie| cookie.trim().strip_prefix(prefix.as_str()))
        .map(str::trim)
        .find(|value| !value.is_empty())
}
