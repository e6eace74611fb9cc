//! Public-facing router endpoint.
//!
//! A [`RouterEndpoint`] accepts any number of client connections on one TCP
//! listener and gives the dispatcher a single receive path. Each connection
//! is assigned an opaque identity; inbound messages get the identity
//! prepended as their first frame, and [`RouterEndpoint::send`] pops that
//! frame to pick the connection a reply goes back out on. The routing core
//! itself never parses identities — they ride along inside the envelope.
//!
//! Binding with port 0 requests an ephemeral port; [`RouterEndpoint::port`]
//! reports the bound port for connection-file advertisement.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::Framed;
use tracing::{debug, warn};
use uuid::Uuid;

use super::framing::MultipartCodec;
use crate::wire::WireMessage;

type ConnMap = Arc<Mutex<HashMap<Bytes, mpsc::UnboundedSender<WireMessage>>>>;

/// A multi-client public endpoint with identity-based reply routing.
pub struct RouterEndpoint {
    name: &'static str,
    port: u16,
    inbound_rx: mpsc::UnboundedReceiver<WireMessage>,
    conns: ConnMap,
    accept_task: tokio::task::JoinHandle<()>,
}

impl RouterEndpoint {
    /// Bind the listener and start accepting clients.
    ///
    /// `name` labels the endpoint in logs (`"shell"` / `"stdin"`).
    pub async fn bind(name: &'static str, ip: &str, port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind((ip, port)).await?;
        let port = listener.local_addr()?.port();

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let conns: ConnMap = Arc::new(Mutex::new(HashMap::new()));

        let accept_conns = Arc::clone(&conns);
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(endpoint = name, error = %e, "accept failed");
                        continue;
                    }
                };
                let identity = Bytes::copy_from_slice(Uuid::new_v4().as_bytes());
                let (mut sink, mut source) = Framed::new(stream, MultipartCodec::new()).split();

                let (conn_tx, mut conn_rx) = mpsc::unbounded_channel::<WireMessage>();
                accept_conns.lock().await.insert(identity.clone(), conn_tx);
                debug!(endpoint = name, %peer, "client connected");

                // Writer: drain the per-connection queue onto the socket.
                tokio::spawn(async move {
                    while let Some(msg) = conn_rx.recv().await {
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                });

                // Reader: prepend the identity and funnel into the shared
                // inbound queue; unregister the connection on EOF or error.
                let inbound = inbound_tx.clone();
                let reader_conns = Arc::clone(&accept_conns);
                tokio::spawn(async move {
                    while let Some(result) = source.next().await {
                        match result {
                            Ok(mut msg) => {
                                msg.push_front(identity.clone());
                                if inbound.send(msg).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(endpoint = name, %peer, error = %e, "client framing error");
                                break;
                            }
                        }
                    }
                    reader_conns.lock().await.remove(&identity);
                    debug!(endpoint = name, %peer, "client disconnected");
                });
            }
        });

        Ok(Self {
            name,
            port,
            inbound_rx,
            conns,
            accept_task,
        })
    }

    /// Bound TCP port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Next inbound message, identity frame first. `None` only if the accept
    /// machinery has died (endpoint unusable).
    pub async fn recv(&mut self) -> Option<WireMessage> {
        self.inbound_rx.recv().await
    }

    /// Route a reply to the connection named by the leading identity frame.
    ///
    /// A missing identity or a disconnected client drops the message with a
    /// warning; a dead subshell client is not an error for the dispatcher.
    pub async fn send(&self, mut msg: WireMessage) {
        let Some(identity) = msg.pop_front() else {
            warn!(endpoint = self.name, "outbound message has no identity frame, dropping");
            return;
        };
        let conns = self.conns.lock().await;
        match conns.get(&identity) {
            Some(tx) => {
                if tx.send(msg).is_err() {
                    warn!(endpoint = self.name, "client writer gone, dropping reply");
                }
            }
            None => {
                warn!(endpoint = self.name, "client disconnected, dropping reply");
            }
        }
    }
}

impl Drop for RouterEndpoint {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}
