//! Channel transports for the routing core.
//!
//! Three kinds of channel cross this module:
//!
//! - [`RouterEndpoint`] — public TCP endpoint, many clients, identity-routed
//!   replies (the shell and stdin channels).
//! - [`Duplex`] — in-process two-ended pipe between the dispatcher and one
//!   subshell worker, and for the control-command channel.
//! - [`ClientConnection`] — the client side of a router endpoint, speaking
//!   the same multipart framing.

pub mod duplex;
pub mod framing;
pub mod router;

use std::io;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

pub use duplex::{duplex, ChannelClosed, Duplex};
pub use framing::MultipartCodec;
pub use router::RouterEndpoint;

use crate::wire::WireMessage;

/// Client side of a [`RouterEndpoint`] connection.
pub struct ClientConnection {
    framed: Framed<TcpStream, MultipartCodec>,
}

impl ClientConnection {
    /// Connect to a router endpoint at `addr` (`"host:port"`).
    pub async fn connect(addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            framed: Framed::new(stream, MultipartCodec::new()),
        })
    }

    /// Send one multipart message.
    pub async fn send(&mut self, msg: WireMessage) -> io::Result<()> {
        self.framed.send(msg).await
    }

    /// Receive the next multipart message. `Ok(None)` on clean EOF.
    pub async fn recv(&mut self) -> io::Result<Option<WireMessage>> {
        self.framed.next().await.transpose()
    }
}
