//! Request signing for the remote API.
//!
//! ```text
//! canonical = method \n host \n path \n token \n date [\n sha256(body)]
//! signature = hex(HMAC-SHA256(secret, hex(sha256(canonical))))
//! ```

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use workshop_shared::errors::{WorkshopError, WorkshopResult};

type HmacSha256 = Hmac<Sha256>;

pub const DATE_HEADER: &str = "x-noop-date";
pub const TOKEN_HEADER: &str = "x-noop-token";
pub const SIGNATURE_HEADER: &str = "x-noop-signature";

/// Session credentials issued by the remote API.
#[derive(Clone)]
pub struct Credentials {
    pub token: String,
    pub secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &self.token)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Header values attached to a signed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub date: String,
    pub token: String,
    pub signature: String,
}

/// Paths served by the guest itself, never signed.
pub fn is_local(path: &str) -> bool {
    path == "/local" || path.starts_with("/local/")
}

/// Public endpoints that are reachable without a session.
pub fn requires_signature(method: &str, path: &str) -> bool {
    let public_get = method == "GET"
        && matches!(path, "/_health" | "/metadata" | "/workshop/logs/events");
    let public_post = method == "POST" && path == "/sessions";
    !(public_get || public_post)
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Sign one request. `date` is milliseconds since the epoch.
pub fn sign(
    method: &str,
    host: &str,
    path: &str,
    body: Option<&str>,
    credentials: &Credentials,
    date: i64,
) -> WorkshopResult<Signature> {
    let date = date.to_string();
    let mut canonical = vec![
        method.to_string(),
        host.to_string(),
        path.to_string(),
        credentials.token.clone(),
        date.clone(),
    ];
    if let Some(body) = body {
        canonical.push(sha256_hex(body.as_bytes()));
    }
    let hash = sha256_hex(canonical.join("\n").as_bytes());

    let mut mac = HmacSha256::new_from_slice(credentials.secret.as_bytes())
        .map_err(|e| WorkshopError::Api(format!("invalid signing secret: {}", e)))?;
    mac.update(hash.as_bytes());

    Ok(Signature {
        date,
        token: credentials.token.clone(),
        signature: hex::encode(mac.finalize().into_bytes()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> Credentials {
        Credentials {
            token: "tok".into(),
            secret: "shh".into(),
        }
    }

    fn expected(canonical: &str, secret: &str) -> String {
        let hash = sha256_hex(canonical.as_bytes());
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(hash.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn test_signature_without_body() {
        let sig = sign("GET", "api.noop.app", "/workshops", None, &credentials(), 1700).unwrap();
        assert_eq!(sig.date, "1700");
        assert_eq!(sig.token, "tok");
        assert_eq!(
            sig.signature,
            expected("GET\napi.noop.app\n/workshops\ntok\n1700", "shh")
        );
    }

    #[test]
    fn test_signature_covers_body_hash() {
        let body = "{}";
        let sig = sign("POST", "api.noop.app:8443", "/x", Some(body), &credentials(), 5).unwrap();
        let canonical = format!(
            "POST\napi.noop.app:8443\n/x\ntok\n5\n{}",
            sha256_hex(body.as_bytes())
        );
        assert_eq!(sig.signature, expected(&canonical, "shh"));
        assert_eq!(sig.signature.len(), 64);
    }

    #[test]
    fn test_local_paths() {
        assert!(is_local("/local"));
        assert!(is_local("/local/workshop/stop"));
        assert!(!is_local("/locale"));
        assert!(!is_local("/workshops"));
    }

    #[test]
    fn test_public_endpoints_unsigned() {
        assert!(!requires_signature("GET", "/_health"));
        assert!(!requires_signature("GET", "/metadata"));
        assert!(!requires_signature("POST", "/sessions"));
        assert!(requires_signature("DELETE", "/sessions"));
        assert!(requires_signature("GET", "/workshops"));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let text = format!("{:?}", credentials());
        assert!(!text.contains("shh"));
    }
}
