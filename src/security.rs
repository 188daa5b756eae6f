use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::env;

type HmacSha256 = Hmac<Sha256>;

/// Holds the channel secret used to authenticate webhook deliveries.
/// Constructed once at startup and injected into the router state so tests
/// can supply a known secret.
#[derive(Clone)]
pub struct WebhookAuth {
    secret: Option<String>,
}

impl WebhookAuth {
    pub fn from_env() -> Self {
        Self::new(env::var("LINE_CHANNEL_SECRET").ok())
    }

    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
        }
    }

    pub fn verify(&self, raw_body: &[u8], header: Option<&str>) -> bool {
        verify_signature(raw_body, header, self.secret.as_deref())
    }
}

/// Checks `x-line-signature` against base64(HMAC-SHA256(secret, raw_body)).
/// Must run on the raw captured bytes, since re-serializing parsed JSON
/// yields a different digest. Missing header or secret is a plain `false`,
/// never a panic.
pub fn verify_signature(raw_body: &[u8], header: Option<&str>, secret: Option<&str>) -> bool {
    let (Some(header), Some(secret)) = (header, secret) else {
        return false;
    };
    let header = header.trim();
    if header.is_empty() || secret.is_empty() {
        return false;
    }
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(raw_body);
    let expected = BASE64.encode(mac.finalize().into_bytes());
    expected.as_bytes() == header.as_bytes()
}
