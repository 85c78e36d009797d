//! JWT request signing for the Upbit private API
//!
//! Every authenticated call carries a short-lived HS256 JWT built from the
//! access key, a fresh nonce, and (for requests with parameters) a SHA-512
//! hash of the exact query string sent on the wire.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::{Digest, Sha256, Sha512};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Upbit API credentials
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key: String,
    secret_key: String,
}

impl Credentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Credentials {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }

    /// Read credentials from `UPBIT_ACCESS_KEY` / `UPBIT_SECRET_KEY`
    pub fn from_env() -> Result<Self> {
        let access_key = std::env::var("UPBIT_ACCESS_KEY")
            .map_err(|_| anyhow!("UPBIT_ACCESS_KEY not set"))?;
        let secret_key = std::env::var("UPBIT_SECRET_KEY")
            .map_err(|_| anyhow!("UPBIT_SECRET_KEY not set"))?;
        Ok(Credentials::new(access_key, secret_key))
    }

    /// `Authorization` header value for one request. `query` must be the
    /// exact encoded query (or form body) string sent on the wire, when any.
    pub fn bearer_token(&self, query: Option<&str>) -> Result<String> {
        let nonce = Uuid::new_v4().to_string();
        let payload = match query {
            Some(q) if !q.is_empty() => json!({
                "access_key": self.access_key,
                "nonce": nonce,
                "query_hash": query_hash(q),
                "query_hash_alg": "SHA512",
            }),
            _ => json!({
                "access_key": self.access_key,
                "nonce": nonce,
            }),
        };
        Ok(format!("Bearer {}", self.sign_jwt(&payload)?))
    }

    fn sign_jwt(&self, payload: &serde_json::Value) -> Result<String> {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload)?);
        let signing_input = format!("{}.{}", header, body);

        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .context("building HMAC for JWT signature")?;
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{}.{}", signing_input, signature))
    }
}

/// SHA-512 hex digest of a query string, as the API expects it
pub fn query_hash(query: &str) -> String {
    hex::encode(Sha512::digest(query.as_bytes()))
}
