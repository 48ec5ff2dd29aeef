//! Connection credentials.
//!
//! A [`Token`] is an opaque signed string proving the identity a client claims. Tokens are
//! minted by a trusted backend; the client only carries them and, when the token is a JWT,
//! reads its `exp` claim to refuse connecting with a credential that is already expired.
//!
//! [`Hs256Issuer`] mints and verifies HS256 JWTs. It stands in for the trusted signer in
//! demos and tests; production clients should receive their tokens from a backend.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac as _};
/// Secret string types that redact values in debug output for security.
pub use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::Result;
use crate::error::Error;

const JWT_HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

/// Signed connection credential.
#[derive(Clone, Debug)]
pub struct Token(SecretString);

impl Token {
    #[must_use]
    pub fn new(token: String) -> Self {
        Self(SecretString::from(token))
    }

    #[must_use]
    pub fn secret(&self) -> &SecretString {
        &self.0
    }

    /// Decode the JWT payload **without** verifying the signature.
    ///
    /// Only the server can verify a token; this is used for local expiry checks.
    pub fn claims(&self) -> Result<Claims> {
        let mut parts = self.0.expose_secret().split('.');
        let (Some(_header), Some(payload), Some(_signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::auth("token is not a JWT"));
        };

        let bytes = URL_SAFE_NO_PAD.decode(payload)?;
        serde_json::from_slice(&bytes).map_err(|e| Error::auth(format!("malformed claims: {e}")))
    }

    /// Whether the token carries an `exp` at or before `now`.
    ///
    /// Tokens that are not JWTs, or carry no `exp`, never expire from the client's point
    /// of view.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.claims()
            .ok()
            .and_then(|claims| claims.expires_at())
            .is_some_and(|exp| exp <= now)
    }

    pub(crate) fn ensure_fresh(&self) -> Result<()> {
        if self.is_expired_at(Utc::now()) {
            return Err(Error::auth("token expired"));
        }
        Ok(())
    }
}

impl From<String> for Token {
    fn from(token: String) -> Self {
        Self::new(token)
    }
}

impl From<&str> for Token {
    fn from(token: &str) -> Self {
        Self::new(token.to_owned())
    }
}

/// Claims carried by connection tokens.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User identity
    pub sub: String,
    /// Expiry as seconds since [`std::time::UNIX_EPOCH`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

impl Claims {
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.exp.and_then(|exp| DateTime::from_timestamp(exp, 0))
    }
}

/// Supplies a token for every connect attempt, including reconnects.
///
/// Implement this to fetch fresh tokens from a backend; a plain [`Token`] is a static source.
#[async_trait]
pub trait TokenSource: Send + Sync + 'static {
    async fn token(&self) -> Result<Token>;
}

#[async_trait]
impl TokenSource for Token {
    async fn token(&self) -> Result<Token> {
        Ok(self.clone())
    }
}

/// HS256 JWT signer and verifier sharing one secret with the server.
#[derive(Clone, Debug)]
pub struct Hs256Issuer {
    secret: SecretString,
}

impl Hs256Issuer {
    #[must_use]
    pub fn new(secret: String) -> Self {
        Self {
            secret: SecretString::from(secret),
        }
    }

    /// Mint a token for `user`, optionally expiring at `expiry`.
    pub fn issue(&self, user: &str, expiry: Option<DateTime<Utc>>) -> Result<Token> {
        let claims = Claims {
            sub: user.to_owned(),
            exp: expiry.map(|at| at.timestamp()),
        };

        let header = URL_SAFE_NO_PAD.encode(JWT_HEADER);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
        let message = format!("{header}.{payload}");
        let signature = hmac(&self.secret, &message)?;

        Ok(Token::new(format!("{message}.{signature}")))
    }

    /// Verify the signature and expiry of `token`, returning its claims.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let Some((message, signature)) = token.rsplit_once('.') else {
            return Err(Error::auth("token is not a JWT"));
        };

        let signature = URL_SAFE_NO_PAD.decode(signature)?;
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret.expose_secret().as_bytes())?;
        mac.update(message.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_e| Error::auth("invalid token signature"))?;

        let token = Token::from(token);
        if token.is_expired_at(Utc::now()) {
            return Err(Error::auth("token expired"));
        }
        token.claims()
    }
}

fn hmac(secret: &SecretString, message: &str) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.expose_secret().as_bytes())?;
    mac.update(message.as_bytes());

    let result = mac.finalize().into_bytes();
    Ok(URL_SAFE_NO_PAD.encode(result))
}
