use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::debug;

/// An opaque bearer token. When the raw string is a JWT, its payload is
/// decoded (without signature verification, we only consume our own
/// provider's tokens) to track expiry and a few informational claims.
#[derive(Debug, Clone)]
pub struct Token {
    raw: String,
    issuer: String,
    scope: String,
    audience: String,
    issue: Option<DateTime<Utc>>,
    expiry: Option<DateTime<Utc>>,
    valid: bool,
}

#[derive(Deserialize, Default)]
struct Claims {
    #[serde(default)]
    iss: String,
    #[serde(default)]
    scope: String,
    #[serde(default)]
    aud: serde_json::Value,
    #[serde(default)]
    iat: Option<i64>,
    #[serde(default)]
    exp: Option<i64>,
}

impl Token {
    pub fn new(raw: &str) -> Self {
        let mut ret = Self {
            raw: raw.to_string(),
            issuer: String::new(),
            scope: String::new(),
            audience: String::new(),
            issue: None,
            expiry: None,
            valid: false,
        };
        ret.decode();
        ret
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_expired(&self) -> bool {
        match self.expiry {
            Some(exp) if self.valid => Utc::now() > exp,
            _ => true,
        }
    }

    fn decode(&mut self) {
        debug!("decoding token");

        // JWT payload is the middle of three base64url segments
        let mut parts = self.raw.split('.');
        let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(_), Some(p), Some(_), None) => p,
            _ => {
                debug!("not a JWT, treating token as opaque");
                return;
            }
        };

        let data = match URL_SAFE_NO_PAD.decode(payload) {
            Ok(d) => d,
            Err(e) => {
                debug!("could not decode token payload: {}", e);
                return;
            }
        };

        let claims: Claims = match serde_json::from_slice(&data) {
            Ok(c) => c,
            Err(e) => {
                debug!("could not parse token claims: {}", e);
                return;
            }
        };

        self.issuer = claims.iss;
        self.scope = claims.scope;
        self.audience = match claims.aud {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        self.issue = claims.iat.and_then(|t| Utc.timestamp_opt(t, 0).single());
        self.expiry = claims.exp.and_then(|t| Utc.timestamp_opt(t, 0).single());
        self.valid = true;

        if let Some(exp) = self.expiry {
            debug!("token decoded, valid until {}", exp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_jwt(claims: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{}.{}.c2lnbmF0dXJl", header, payload)
    }

    #[test]
    fn test_decodes_jwt_claims() {
        let exp = (Utc::now() + chrono::Duration::hours(1)).timestamp();
        let token = Token::new(&make_jwt(serde_json::json!({
            "iss": "hub.docker.com",
            "aud": "registry",
            "exp": exp,
            "iat": exp - 3600,
        })));
        assert!(token.is_valid());
        assert!(!token.is_expired());
        assert_eq!(token.issuer(), "hub.docker.com");
        assert_eq!(token.audience(), "registry");
    }

    #[test]
    fn test_expired_jwt() {
        let token = Token::new(&make_jwt(serde_json::json!({
            "exp": (Utc::now() - chrono::Duration::hours(1)).timestamp(),
        })));
        assert!(token.is_valid());
        assert!(token.is_expired());
    }

    #[test]
    fn test_opaque_token_counts_as_expired() {
        let token = Token::new("not-a-jwt");
        assert!(!token.is_valid());
        assert!(token.is_expired());
        assert_eq!(token.raw(), "not-a-jwt");
    }
}
