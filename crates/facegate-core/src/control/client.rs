//! Control channel client: connect, send one command, read one reply.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio_util::codec::Framed;

use super::transport::{ClientStream, connect};
use super::{ControlCodec, ControlEndpoint, ControlError};

/// A connection to a running service's control channel.
pub struct ControlClient {
    framed: Framed<ClientStream, ControlCodec>,
}

impl ControlClient {
    pub async fn connect(endpoint: &ControlEndpoint) -> Result<Self, ControlError> {
        let stream = connect(endpoint).await?;
        Ok(Self {
            framed: Framed::new(stream, ControlCodec),
        })
    }

    /// Send `command` and wait for its reply, up to `timeout` if given.
    pub async fn request(
        &mut self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<String, ControlError> {
        self.framed.send(command).await?;

        let reply = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.framed.next())
                .await
                .map_err(|_| ControlError::Timeout(limit))?,
            None => self.framed.next().await,
        };

        match reply {
            Some(reply) => Ok(reply?),
            None => Err(ControlError::NoReply),
        }
    }
}

/// Connect, send one command, return the reply, disconnect.
pub async fn send_command(
    endpoint: &ControlEndpoint,
    command: &str,
    timeout: Option<Duration>,
) -> Result<String, ControlError> {
    let mut client = ControlClient::connect(endpoint).await?;
    client.request(command, timeout).await
}
