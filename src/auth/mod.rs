//! Registry credentials and their refresh strategies.
//!
//! A [`Credentials`] value holds either a username/password pair, an opaque
//! bearer token, or nothing (anonymous). Cloud registries with expiring
//! tokens bind a [`Refresher`] that renews the pair in place; relays receive
//! the wire form produced by the credentials' [`AuthEncoder`].

pub mod ecr;
pub mod gcr;
pub mod token;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::auth::token::Token;

/// Credentials shared between a location and its repository lister. All
/// access goes through the engine's single loop, the mutex only satisfies
/// the sharing.
pub type SharedCredentials = Arc<Mutex<Credentials>>;

/// Renews expiring credentials for a registry.
#[async_trait]
pub trait Refresher: Send + Sync {
    async fn refresh(&mut self, creds: &mut Credentials) -> Result<()>;
}

/// How credentials serialise into the wire format relays expect.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum AuthEncoder {
    /// base64 of `user:password`
    #[default]
    Basic,
    /// base64 of `{"username": ..., "password": ...}`
    BasicJson,
}

impl AuthEncoder {
    fn encode(&self, c: &Credentials) -> String {
        if c.username.is_empty() && c.password.is_empty() {
            return String::new();
        }
        match self {
            AuthEncoder::Basic => BASE64.encode(format!("{}:{}", c.username, c.password)),
            AuthEncoder::BasicJson => BASE64.encode(format!(
                r#"{{"username": "{}", "password": "{}"}}"#,
                c.username, c.password
            )),
        }
    }
}

#[derive(Default)]
pub struct Credentials {
    username: String,
    password: String,
    token: Option<Token>,
    encoder: AuthEncoder,
    refresher: Option<Box<dyn Refresher>>,
}

impl Credentials {
    pub fn from_basic(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            ..Default::default()
        }
    }

    /// Decode a base64 auth string. JSON `{"username","password"}` blobs keep
    /// the JSON encoder, plain `user:pass` the basic one.
    pub fn from_auth(auth: &str) -> Result<Self> {
        let data = BASE64.decode(auth)?;

        #[derive(Deserialize)]
        struct JsonCreds {
            #[serde(default)]
            username: String,
            #[serde(default)]
            password: String,
        }

        let mut ret = Credentials::default();
        match serde_json::from_slice::<JsonCreds>(&data) {
            Ok(crd) => {
                ret.encoder = AuthEncoder::BasicJson;
                ret.username = crd.username;
                ret.password = crd.password;
            }
            Err(_) => {
                ret.encoder = AuthEncoder::Basic;
                let data = String::from_utf8(data)?;
                match data.split_once(':') {
                    Some((user, pass)) => {
                        ret.username = user.to_string();
                        ret.password = pass.to_string();
                    }
                    None => ret.username = data,
                }
            }
        }

        Ok(ret)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn set_basic(&mut self, username: String, password: String, encoder: AuthEncoder) {
        self.username = username;
        self.password = password;
        self.encoder = encoder;
    }

    /// The serialised wire form, empty when anonymous.
    pub fn auth(&self) -> String {
        self.encoder.encode(self)
    }

    pub fn token(&self) -> Option<&Token> {
        self.token.as_ref()
    }

    pub fn set_token(&mut self, t: Token) {
        self.token = Some(t);
    }

    pub fn set_refresher(&mut self, r: Box<dyn Refresher>) {
        self.refresher = Some(r);
    }

    pub async fn refresh(&mut self) -> Result<()> {
        // the refresher is detached while it runs so it can mutate us
        let mut refresher = match self.refresher.take() {
            Some(r) => r,
            None => return Ok(()),
        };
        let res = refresher.refresh(self).await;
        self.refresher = Some(refresher);
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_auth_is_empty() {
        let creds = Credentials::default();
        assert_eq!(creds.auth(), "");
    }

    #[test]
    fn test_basic_auth_roundtrip() {
        let creds = Credentials::from_basic("johndoe", "secret");
        let decoded = BASE64.decode(creds.auth()).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), "johndoe:secret");
    }

    #[test]
    fn test_from_auth_plain() {
        let auth = BASE64.encode("johndoe:secret");
        let creds = Credentials::from_auth(&auth).unwrap();
        assert_eq!(creds.username(), "johndoe");
        assert_eq!(creds.password(), "secret");
        // round trip keeps the basic wire form
        assert_eq!(creds.auth(), auth);
    }

    #[test]
    fn test_from_auth_json() {
        let auth = BASE64.encode(r#"{"username": "johndoe", "password": "secret"}"#);
        let creds = Credentials::from_auth(&auth).unwrap();
        assert_eq!(creds.username(), "johndoe");
        assert_eq!(creds.password(), "secret");
        assert_eq!(crate::util::decode_json_auth(&creds.auth()), "johndoe:secret");
    }

    #[tokio::test]
    async fn test_refresh_without_refresher_is_idempotent() {
        let mut creds = Credentials::from_basic("johndoe", "secret");
        let before = creds.auth();
        creds.refresh().await.unwrap();
        assert_eq!(creds.auth(), before);
    }

    #[tokio::test]
    async fn test_refresher_mutates_credentials() {
        struct Rotate;

        #[async_trait]
        impl Refresher for Rotate {
            async fn refresh(&mut self, creds: &mut Credentials) -> Result<()> {
                creds.set_basic("AWS".into(), "fresh".into(), AuthEncoder::BasicJson);
                Ok(())
            }
        }

        let mut creds = Credentials::default();
        creds.set_refresher(Box::new(Rotate));
        creds.refresh().await.unwrap();
        assert_eq!(crate::util::decode_json_auth(&creds.auth()), "AWS:fresh");
    }
}
