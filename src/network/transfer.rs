//! Local rendezvous sockets for file transfers.
//!
//! Accepting or providing a file binds a listener on the configured
//! address. The first client to connect gets its socket handed back to the
//! connection actor, which passes it to the account client.

use std::io;
use std::net::{IpAddr, SocketAddr};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::state::channels::ChannelId;

/// A socket accepted for a transfer channel.
#[derive(Debug)]
pub struct AcceptedSocket {
    pub channel: ChannelId,
    pub socket: TcpStream,
    pub peer: SocketAddr,
}

pub struct TransferListener {
    listener: TcpListener,
    address: SocketAddr,
}

impl TransferListener {
    /// Bind on an ephemeral port of `ip`.
    pub async fn bind(ip: IpAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(ip, 0)).await?;
        let address = listener.local_addr()?;
        debug!(%address, "transfer listener bound");
        Ok(Self { listener, address })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Wait for one client in the background.
    pub fn spawn(self, channel: ChannelId, sockets: mpsc::Sender<AcceptedSocket>) -> JoinHandle<()> {
        tokio::spawn(async move {
            match self.listener.accept().await {
                Ok((socket, peer)) => {
                    info!(channel = %channel, %peer, "transfer client connected");
                    let accepted = AcceptedSocket {
                        channel,
                        socket,
                        peer,
                    };
                    if sockets.send(accepted).await.is_err() {
                        debug!(channel = %channel, "connection gone before socket delivery");
                    }
                }
                Err(e) => warn!(channel = %channel, error = %e, "transfer accept failed"),
            }
        })
    }
}
