use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use strum_macros::Display;

use crate::protocol::codes;

/// Broad category of a failure, stable enough to branch on.
#[non_exhaustive]
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum Kind {
    /// Token was missing, malformed, expired or rejected by the server
    Auth,
    /// Connection-level failure: dial, handshake, heartbeat or closed socket
    Transport,
    /// Server (or the local registry) refused to join a channel
    Subscribe,
    /// Publish was refused, timed out or could not be sent
    Publish,
    /// Error related to invalid input or state within chanpub-client-sdk
    Validation,
    /// A task panicked or a dependency failed in a way callers cannot act on
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Validation {
            reason: message.into(),
        }
        .into()
    }

    pub fn auth<S: Into<String>>(message: S) -> Self {
        AuthRejected {
            code: None,
            reason: message.into(),
        }
        .into()
    }

    /// Re-tag this error with a different [`Kind`], keeping its source.
    ///
    /// Used by the publish path, where every failure (including transport ones)
    /// is reported as [`Kind::Publish`].
    #[must_use]
    pub fn into_kind(self, kind: Kind) -> Self {
        Self { kind, ..self }
    }

    /// Protocol error code carried by a server rejection, if any.
    #[must_use]
    pub fn code(&self) -> Option<u32> {
        if let Some(e) = self.downcast_ref::<SubscribeRejected>() {
            return Some(e.code);
        }
        if let Some(e) = self.downcast_ref::<PublishRejected>() {
            return Some(e.code);
        }
        self.downcast_ref::<AuthRejected>().and_then(|e| e.code)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error", self.kind)?;
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// Input refused before anything was sent.
#[non_exhaustive]
#[derive(Debug)]
pub struct Validation {
    pub reason: String,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

impl StdError for Validation {}

/// The token was refused, either locally (expired, malformed) or by the server.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct AuthRejected {
    /// Protocol error code when the server rejected the token
    pub code: Option<u32>,
    pub reason: String,
}

impl fmt::Display for AuthRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "authentication rejected ({code}): {}", self.reason),
            None => write!(f, "authentication rejected: {}", self.reason),
        }
    }
}

impl StdError for AuthRejected {}

#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct SubscribeRejected {
    pub channel: String,
    pub code: u32,
    pub reason: String,
}

impl SubscribeRejected {
    /// Whether retrying the subscription can never succeed.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self.code,
            codes::UNAUTHORIZED
                | codes::UNKNOWN_CHANNEL
                | codes::PERMISSION_DENIED
                | codes::ALREADY_SUBSCRIBED
                | codes::BAD_REQUEST
        )
    }
}

impl fmt::Display for SubscribeRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "subscription to {} rejected ({}): {}",
            self.channel, self.code, self.reason
        )
    }
}

impl StdError for SubscribeRejected {}

#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct PublishRejected {
    pub channel: String,
    pub code: u32,
    pub reason: String,
}

impl fmt::Display for PublishRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "publish to {} rejected ({}): {}",
            self.channel, self.code, self.reason
        )
    }
}

impl StdError for PublishRejected {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Error::with_source(Kind::Auth, e)
    }
}

impl From<hmac::digest::InvalidLength> for Error {
    fn from(e: hmac::digest::InvalidLength) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Validation, e)
    }
}

impl From<Validation> for Error {
    fn from(err: Validation) -> Self {
        Error::with_source(Kind::Validation, err)
    }
}

impl From<AuthRejected> for Error {
    fn from(err: AuthRejected) -> Self {
        Error::with_source(Kind::Auth, err)
    }
}

impl From<SubscribeRejected> for Error {
    fn from(err: SubscribeRejected) -> Self {
        Error::with_source(Kind::Subscribe, err)
    }
}

impl From<PublishRejected> for Error {
    fn from(err: PublishRejected) -> Self {
        Error::with_source(Kind::Publish, err)
    }
}
