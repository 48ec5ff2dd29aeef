use serde::Serialize;

use crate::Result;
use crate::error::{Error, Kind, PublishRejected};
use crate::protocol::{Method, Reply};
use crate::ws::{ConnectionManager, WsError};

/// Server acknowledgement of a publication.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishAck {
    pub channel: String,
}

/// Publish `payload` into `channel` and wait for the acknowledgement.
///
/// Every failure is reported with [`Kind::Publish`]; the source tells a server refusal
/// ([`PublishRejected`]) from a transport problem ([`WsError`]).
pub(crate) async fn send<T: Serialize + ?Sized>(
    connection: &ConnectionManager,
    channel: &str,
    payload: &T,
) -> Result<PublishAck> {
    if channel.is_empty() {
        return Err(Error::validation("channel name must not be empty").into_kind(Kind::Publish));
    }

    let data = serde_json::to_value(payload).map_err(|e| Error::with_source(Kind::Publish, e))?;

    match connection.request(Method::publish(channel, data), None).await {
        Ok(Ok(Reply::Publish)) => Ok(PublishAck {
            channel: channel.to_owned(),
        }),
        Ok(Ok(other)) => Err(Error::with_source(
            Kind::Publish,
            WsError::InvalidMessage(format!("unexpected reply to publish: {other:?}")),
        )),
        Ok(Err(e)) => {
            #[cfg(feature = "tracing")]
            tracing::debug!(%channel, code = e.code, "Publication rejected");

            Err(PublishRejected {
                channel: channel.to_owned(),
                code: e.code,
                reason: e.message,
            }
            .into())
        }
        Err(e) => Err(e.into_kind(Kind::Publish)),
    }
}
