//! Transport seam between the peer group and the network
//!
//! A connection is a pair of channels; the TCP connector feeds them from
//! a framed socket with one reader and one writer task per peer.

use crate::core::Network;
use crate::network::codec::{MessageCodec, WireError};
use crate::network::message::{Message, NetworkMessageParser};
use crate::network::peer::PeerError;
use async_trait::async_trait;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

/// Both directions of one peer connection. Dropping `outgoing` closes
/// the connection; `incoming` ends when the remote side goes away.
pub struct PeerConnection {
    pub outgoing: mpsc::UnboundedSender<Message>,
    pub incoming: mpsc::UnboundedReceiver<Result<Message, WireError>>,
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<PeerConnection, PeerError>;
}

pub struct TcpConnector {
    network: Network,
    parser: Arc<NetworkMessageParser>,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(network: Network, parser: Arc<NetworkMessageParser>, connect_timeout: Duration) -> Self {
        Self {
            network,
            parser,
            connect_timeout,
        }
    }
}

#[async_trait]
impl PeerConnector for TcpConnector {
    async fn connect(&self, address: &str) -> Result<PeerConnection, PeerError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| PeerError::Timeout(format!("connect to {}", address)))?
            .map_err(|e| PeerError::ConnectionFailed(e.to_string()))?;

        let framed = Framed::new(stream, MessageCodec::new(self.network, self.parser.clone()));
        let (mut writer, mut reader) = framed.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let (incoming_tx, incoming) = mpsc::unbounded_channel();

        let peer = address.to_string();
        tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                if let Err(e) = writer.send(message).await {
                    log::debug!("Write to {} failed: {}", peer, e);
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(item) = reader.next().await {
                let failed = item.is_err();
                if incoming_tx.send(item).is_err() || failed {
                    break;
                }
            }
        });

        Ok(PeerConnection { outgoing, incoming })
    }
}

/// The remote end of an in-memory connection
pub struct RemotePeer {
    pub sent_to_us: mpsc::UnboundedSender<Result<Message, WireError>>,
    pub received: mpsc::UnboundedReceiver<Message>,
}

/// Connected in-memory channel pair
pub fn channel_connection() -> (PeerConnection, RemotePeer) {
    let (outgoing, received) = mpsc::unbounded_channel();
    let (sent_to_us, incoming) = mpsc::unbounded_channel();
    (
        PeerConnection { outgoing, incoming },
        RemotePeer { sent_to_us, received },
    )
}
