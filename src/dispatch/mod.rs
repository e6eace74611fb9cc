//! Shell dispatcher: the routing hub between public channels and subshells.
//!
//! [`ShellDispatcher`] owns the public shell and stdin endpoints, the
//! in-process control-command channel, and the pool of internal duplex
//! channels — one per live subshell. Its event loop bridges the two worlds:
//!
//! - Public traffic is addressed by subshell id (read from the envelope by
//!   the codec), tagged with a routing key, and forwarded to the matching
//!   subshell channel.
//! - Subshell traffic carries a leading routing key naming the public channel
//!   (or the control channel) the remainder is forwarded to.
//! - Control commands administer the pool (`add_subshell`/`remove_subshell`)
//!   and signal shutdown (`stop`).
//!
//! ## Pool discipline
//!
//! The pool is a single ordered list of `{id, channel}` records. The default
//! subshell (`id == ""`) is created at bind time, is always first, and can
//! never be removed. Readiness is derived from the records themselves each
//! loop iteration, so there is no separate poll list to keep index-aligned.
//! The pool is mutated only from the dispatcher task, inside control-command
//! handling — single writer, no locking.
//!
//! ## Addressing policy
//!
//! A public message addressed to a subshell id that does not exist is dropped
//! with a warning naming the id. Messages whose envelope carries no subshell
//! id (or an empty one) go to the default subshell.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use futures::future::select_all;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::protocol::SharedCodec;
use crate::transport::{duplex, Duplex, RouterEndpoint};
use crate::wire::{RoutingKey, WireMessage};

/// Startup failure of the dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to bind {endpoint} endpoint: {source}")]
    Bind {
        endpoint: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Everything a subshell worker needs to join the router: its end of the
/// internal channel and the outward publication sender.
pub struct WorkerLink {
    pub chan: Duplex,
    pub iopub: mpsc::UnboundedSender<WireMessage>,
}

/// Rendezvous point between the dispatcher and subshell tasks.
///
/// `add_subshell` deposits the worker end of each freshly created channel
/// here; the task that will run the subshell takes it by id. Cloneable — all
/// clones share the same map.
#[derive(Clone)]
pub struct SubshellRegistry {
    links: Arc<Mutex<HashMap<String, WorkerLink>>>,
    iopub: mpsc::UnboundedSender<WireMessage>,
}

impl SubshellRegistry {
    /// `iopub` is the outward publication channel handed to every worker.
    #[must_use]
    pub fn new(iopub: mpsc::UnboundedSender<WireMessage>) -> Self {
        Self {
            links: Arc::new(Mutex::new(HashMap::new())),
            iopub,
        }
    }

    async fn deposit(&self, id: &str, chan: Duplex) {
        let link = WorkerLink {
            chan,
            iopub: self.iopub.clone(),
        };
        self.links.lock().await.insert(id.to_string(), link);
    }

    /// Claim the worker end for subshell `id`. Each link can be taken once.
    pub async fn take(&self, id: &str) -> Option<WorkerLink> {
        self.links.lock().await.remove(id)
    }

    async fn discard(&self, id: &str) {
        self.links.lock().await.remove(id);
    }
}

/// Peer handle for the control-command channel.
///
/// Request/reply with a single in-flight request by convention; replies to
/// forwarded (non-administrative) commands arrive from the active subshell
/// worker rather than the dispatcher itself.
pub struct ControlHandle {
    chan: Duplex,
}

impl ControlHandle {
    /// Send a command and wait for the reply. `None` if the dispatcher has
    /// shut down.
    pub async fn request(&mut self, msg: WireMessage) -> Option<WireMessage> {
        self.chan.send(msg).ok()?;
        self.chan.recv().await
    }

    /// Send without waiting (for commands the dispatcher never answers).
    pub fn send(&self, msg: WireMessage) -> bool {
        self.chan.send(msg).is_ok()
    }

    /// Wait for the next message from the dispatcher side.
    pub async fn recv(&mut self) -> Option<WireMessage> {
        self.chan.recv().await
    }
}

struct SubshellRecord {
    id: String,
    chan: Duplex,
}

/// One ready source per loop iteration, in fixed priority order.
enum Ready {
    Shell(Option<WireMessage>),
    Stdin(Option<WireMessage>),
    Controller(Option<WireMessage>),
    Subshell(usize, Option<WireMessage>),
}

/// The routing hub. See the module docs for the overall design.
pub struct ShellDispatcher {
    shell: RouterEndpoint,
    stdin: RouterEndpoint,
    controller: Duplex,
    subshells: Vec<SubshellRecord>,
    registry: SubshellRegistry,
    codec: SharedCodec,
}

impl ShellDispatcher {
    /// Bind the public endpoints and create the default subshell.
    ///
    /// `shell_port`/`stdin_port` of 0 request ephemeral ports. Returns the
    /// dispatcher and the peer handle for the control-command channel. Any
    /// bind failure is fatal to startup.
    pub async fn bind(
        ip: &str,
        shell_port: u16,
        stdin_port: u16,
        registry: SubshellRegistry,
        codec: SharedCodec,
    ) -> Result<(Self, ControlHandle), DispatchError> {
        let shell = RouterEndpoint::bind("shell", ip, shell_port)
            .await
            .map_err(|source| DispatchError::Bind {
                endpoint: "shell",
                source,
            })?;
        let stdin = RouterEndpoint::bind("stdin", ip, stdin_port)
            .await
            .map_err(|source| DispatchError::Bind {
                endpoint: "stdin",
                source,
            })?;
        let (controller, control_peer) = duplex();

        let mut dispatcher = Self {
            shell,
            stdin,
            controller,
            subshells: Vec::new(),
            registry,
            codec,
        };
        // The default subshell exists for the dispatcher's whole lifetime.
        dispatcher.add_subshell("").await;
        info!(
            shell_port = dispatcher.shell_port(),
            stdin_port = dispatcher.stdin_port(),
            "dispatcher bound"
        );
        Ok((dispatcher, ControlHandle { chan: control_peer }))
    }

    /// Bound port of the public shell endpoint.
    #[must_use]
    pub fn shell_port(&self) -> u16 {
        self.shell.port()
    }

    /// Bound port of the public stdin endpoint.
    #[must_use]
    pub fn stdin_port(&self) -> u16 {
        self.stdin.port()
    }

    /// Live subshell ids in pool order (default first).
    #[must_use]
    pub fn subshell_ids(&self) -> Vec<String> {
        self.subshells.iter().map(|r| r.id.clone()).collect()
    }

    #[must_use]
    pub fn subshell_count(&self) -> usize {
        self.subshells.len()
    }

    /// Event loop. Handles exactly one ready source per iteration, in fixed
    /// priority order: public shell, public stdin, control channel, then
    /// subshells in pool order. Returns when a `stop` command is handled or
    /// a structurally required channel dies.
    pub async fn run(&mut self) {
        loop {
            let ready = {
                // The pool is never empty (default subshell), so select_all
                // always has at least one future.
                let subshell_recv =
                    select_all(self.subshells.iter_mut().map(|rec| Box::pin(rec.chan.recv())));
                tokio::select! {
                    biased;
                    msg = self.shell.recv() => Ready::Shell(msg),
                    msg = self.stdin.recv() => Ready::Stdin(msg),
                    msg = self.controller.recv() => Ready::Controller(msg),
                    (msg, index, _) = subshell_recv => Ready::Subshell(index, msg),
                }
            };

            match ready {
                Ready::Shell(Some(msg)) => self.dispatch(msg, RoutingKey::Shell),
                Ready::Stdin(Some(msg)) => self.dispatch(msg, RoutingKey::Stdin),
                Ready::Controller(Some(msg)) => {
                    if self.dispatch_controller(msg).await {
                        info!("stop handled, dispatcher exiting");
                        return;
                    }
                }
                Ready::Subshell(_, Some(msg)) => self.dispatch_subshell(msg).await,
                Ready::Shell(None) | Ready::Stdin(None) => {
                    error!("public endpoint closed, dispatcher exiting");
                    return;
                }
                Ready::Controller(None) => {
                    warn!("control channel closed, dispatcher exiting");
                    return;
                }
                Ready::Subshell(index, None) => {
                    if index == 0 {
                        // The default subshell's worker is gone; the kernel
                        // context no longer exists.
                        error!("default subshell channel closed, dispatcher exiting");
                        return;
                    }
                    let record = self.subshells.remove(index);
                    self.registry.discard(&record.id).await;
                    warn!(subshell_id = %record.id, "subshell channel closed, removed from pool");
                }
            }
        }
    }

    /// Public → internal: address by subshell id, tag, forward.
    fn dispatch(&mut self, mut msg: WireMessage, key: RoutingKey) {
        let id = self.codec.subshell_id(&msg).unwrap_or_default();
        msg.tag(key);
        match self.subshells.iter().find(|rec| rec.id == id) {
            Some(record) => {
                if record.chan.send(msg).is_err() {
                    warn!(subshell_id = %id, "subshell channel closed, message dropped");
                }
            }
            None => {
                warn!(subshell_id = %id, "message addressed to unknown subshell, dropped");
            }
        }
    }

    /// Internal → public: pop the routing key, forward the remainder.
    async fn dispatch_subshell(&mut self, mut msg: WireMessage) {
        match msg.pop_routing_key() {
            Some(RoutingKey::Shell) => self.shell.send(msg).await,
            Some(RoutingKey::Stdin) => self.stdin.send(msg).await,
            Some(RoutingKey::Control) => {
                if self.controller.send(msg).is_err() {
                    debug!("control peer gone, subshell reply dropped");
                }
            }
            None => {
                warn!("subshell message with unrecognized routing key, dropped");
            }
        }
    }

    /// Control-command protocol. Returns true when the server should stop.
    async fn dispatch_controller(&mut self, msg: WireMessage) -> bool {
        let Some(command) = msg.peek_str(0).map(str::to_owned) else {
            warn!("control command with non-UTF-8 leading frame, dropped");
            return false;
        };
        match command.as_str() {
            "stop" => {
                for record in &self.subshells {
                    let mut stop = WireMessage::from_str_frames(&["stop"]);
                    stop.tag(RoutingKey::Control);
                    if record.chan.send(stop).is_err() {
                        debug!(subshell_id = %record.id, "stop broadcast to closed channel");
                    }
                }
                // Echo the request back as the reply.
                if self.controller.send(msg).is_err() {
                    debug!("control peer gone, stop echo dropped");
                }
                true
            }
            "add_subshell" => {
                let added = match msg.peek_str(1) {
                    Some(id) => {
                        let id = id.to_owned();
                        self.add_subshell(&id).await
                    }
                    None => false,
                };
                self.reply_status(added);
                false
            }
            "remove_subshell" => {
                let removed = match msg.peek_str(1) {
                    Some(id) => {
                        let id = id.to_owned();
                        self.remove_subshell(&id).await
                    }
                    None => false,
                };
                self.reply_status(removed);
                false
            }
            _ => {
                // Anything else is ordinary control traffic for the active
                // kernel context: forwarded verbatim to the default subshell.
                // The reply, if any, comes back control-tagged through
                // dispatch_subshell.
                if let Some(record) = self.subshells.first() {
                    if record.chan.send(msg).is_err() {
                        warn!("default subshell channel closed, control command dropped");
                    }
                }
                false
            }
        }
    }

    fn reply_status(&self, ok: bool) {
        let status = if ok { "success" } else { "error" };
        if self
            .controller
            .send(WireMessage::from_str_frames(&[status]))
            .is_err()
        {
            debug!("control peer gone, status reply dropped");
        }
    }

    /// Create subshell `id`. False (no mutation) if the id is already live.
    pub async fn add_subshell(&mut self, id: &str) -> bool {
        if self.subshells.iter().any(|rec| rec.id == id) {
            return false;
        }
        let (dispatcher_end, worker_end) = duplex();
        self.registry.deposit(id, worker_end).await;
        self.subshells.push(SubshellRecord {
            id: id.to_string(),
            chan: dispatcher_end,
        });
        info!(subshell_id = %id, total = self.subshells.len(), "subshell created");
        true
    }

    /// Destroy subshell `id`. False for the default subshell (permanent) or
    /// an unknown id.
    pub async fn remove_subshell(&mut self, id: &str) -> bool {
        if id.is_empty() {
            return false;
        }
        let Some(index) = self.subshells.iter().position(|rec| rec.id == id) else {
            return false;
        };
        self.subshells.remove(index);
        // Also drop an un-claimed worker end so the channel fully closes.
        self.registry.discard(id).await;
        info!(subshell_id = %id, total = self.subshells.len(), "subshell removed");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Codec, JsonCodec, KernelMessage, MessageHeader};
    use crate::subshell::{SubChannel, SubshellWorker};
    use crate::transport::ClientConnection;
    use serde_json::json;
    use std::time::Duration;

    async fn bind_dispatcher() -> (ShellDispatcher, ControlHandle, SubshellRegistry) {
        let (iopub_tx, _iopub_rx) = mpsc::unbounded_channel();
        let registry = SubshellRegistry::new(iopub_tx);
        let (dispatcher, control) = ShellDispatcher::bind(
            "127.0.0.1",
            0,
            0,
            registry.clone(),
            Arc::new(JsonCodec),
        )
        .await
        .unwrap();
        (dispatcher, control, registry)
    }

    fn request(msg_type: &str, subshell_id: Option<&str>) -> KernelMessage {
        KernelMessage {
            identities: Vec::new(),
            header: MessageHeader {
                msg_id: "m1".into(),
                session: "s1".into(),
                msg_type: msg_type.into(),
                subshell_id: subshell_id.map(str::to_owned),
            },
            content: json!({}),
        }
    }

    #[tokio::test]
    async fn test_pool_invariants_across_mutations() {
        let (mut dispatcher, _control, _registry) = bind_dispatcher().await;
        assert_eq!(dispatcher.subshell_ids(), vec![String::new()]);

        assert!(dispatcher.add_subshell("A").await);
        assert!(dispatcher.add_subshell("B").await);
        // Duplicate add fails and leaves exactly one record.
        assert!(!dispatcher.add_subshell("A").await);
        assert_eq!(dispatcher.subshell_ids(), vec!["", "A", "B"]);

        assert!(dispatcher.remove_subshell("A").await);
        assert!(!dispatcher.remove_subshell("A").await);
        assert_eq!(dispatcher.subshell_ids(), vec!["", "B"]);

        // The default subshell can never be removed.
        assert!(!dispatcher.remove_subshell("").await);
        assert_eq!(dispatcher.subshell_count(), 2);
        assert_eq!(dispatcher.subshell_ids()[0], "");
    }

    #[tokio::test]
    async fn test_controller_admin_protocol() {
        let (mut dispatcher, mut control, _registry) = bind_dispatcher().await;
        let task = tokio::spawn(async move {
            dispatcher.run().await;
        });

        let reply = control
            .request(WireMessage::from_str_frames(&["add_subshell", "A"]))
            .await
            .unwrap();
        assert_eq!(reply.peek_str(0), Some("success"));

        let reply = control
            .request(WireMessage::from_str_frames(&["add_subshell", "A"]))
            .await
            .unwrap();
        assert_eq!(reply.peek_str(0), Some("error"));

        let reply = control
            .request(WireMessage::from_str_frames(&["remove_subshell", "A"]))
            .await
            .unwrap();
        assert_eq!(reply.peek_str(0), Some("success"));

        let reply = control
            .request(WireMessage::from_str_frames(&["remove_subshell", "A"]))
            .await
            .unwrap();
        assert_eq!(reply.peek_str(0), Some("error"));

        // Removing the default subshell is always an error.
        let reply = control
            .request(WireMessage::from_str_frames(&["remove_subshell", ""]))
            .await
            .unwrap();
        assert_eq!(reply.peek_str(0), Some("error"));

        let echo = control
            .request(WireMessage::from_str_frames(&["stop"]))
            .await
            .unwrap();
        assert_eq!(echo.peek_str(0), Some("stop"));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_broadcasts_to_every_subshell() {
        let (mut dispatcher, mut control, registry) = bind_dispatcher().await;
        dispatcher.add_subshell("B").await;
        let mut default_link = registry.take("").await.unwrap();
        let mut b_link = registry.take("B").await.unwrap();

        let task = tokio::spawn(async move {
            dispatcher.run().await;
        });

        let echo = control
            .request(WireMessage::from_str_frames(&["stop"]))
            .await
            .unwrap();
        assert_eq!(echo.peek_str(0), Some("stop"));

        for link in [&mut default_link, &mut b_link] {
            let mut msg = link.chan.recv().await.unwrap();
            assert_eq!(msg.pop_routing_key(), Some(RoutingKey::Control));
            assert_eq!(msg.peek_str(0), Some("stop"));
        }
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_command_forwarded_to_default_subshell() {
        let (mut dispatcher, mut control, registry) = bind_dispatcher().await;
        let mut default_link = registry.take("").await.unwrap();
        let task = tokio::spawn(async move {
            dispatcher.run().await;
        });

        assert!(control.send(WireMessage::from_str_frames(&["interrupt_request"])));
        // Forwarded verbatim: no routing key prepended.
        let msg = default_link.chan.recv().await.unwrap();
        assert_eq!(msg.peek_str(0), Some("interrupt_request"));

        control
            .request(WireMessage::from_str_frames(&["stop"]))
            .await
            .unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_end_to_end_shell_round_trip() {
        let (mut dispatcher, mut control, registry) = bind_dispatcher().await;
        let shell_addr = format!("127.0.0.1:{}", dispatcher.shell_port());
        let codec = JsonCodec;

        let task = tokio::spawn(async move {
            dispatcher.run().await;
        });

        // Create subshell "A" and claim its worker end.
        let reply = control
            .request(WireMessage::from_str_frames(&["add_subshell", "A"]))
            .await
            .unwrap();
        assert_eq!(reply.peek_str(0), Some("success"));
        let mut worker = SubshellWorker::connect(&registry, "A", Arc::new(JsonCodec))
            .await
            .unwrap();

        // Public shell message addressed to "A".
        let mut client = ClientConnection::connect(&shell_addr).await.unwrap();
        client
            .send(codec.serialize(&request("execute_request", Some("A"))))
            .await
            .unwrap();

        // The worker sees it on the shell stream.
        assert_eq!(
            worker.poll_channels(Duration::from_secs(5)).await,
            Some(SubChannel::Shell)
        );
        let msg = worker.read_shell().unwrap();
        assert_eq!(msg.header.msg_type, "execute_request");

        // Reply flows back to the same public client.
        let reply_msg = KernelMessage {
            identities: msg.identities.clone(),
            header: MessageHeader {
                msg_id: "m2".into(),
                session: "s1".into(),
                msg_type: "execute_reply".into(),
                subshell_id: Some("A".into()),
            },
            content: json!({"status": "ok"}),
        };
        worker.send_shell(codec.serialize(&reply_msg)).unwrap();

        let wire = client.recv().await.unwrap().unwrap();
        let received = codec.deserialize(&wire).unwrap();
        assert_eq!(received.header.msg_type, "execute_reply");

        // Tear down "A", twice.
        let reply = control
            .request(WireMessage::from_str_frames(&["remove_subshell", "A"]))
            .await
            .unwrap();
        assert_eq!(reply.peek_str(0), Some("success"));
        let reply = control
            .request(WireMessage::from_str_frames(&["remove_subshell", "A"]))
            .await
            .unwrap();
        assert_eq!(reply.peek_str(0), Some("error"));

        control
            .request(WireMessage::from_str_frames(&["stop"]))
            .await
            .unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_subshell_address_is_dropped() {
        let (mut dispatcher, mut control, registry) = bind_dispatcher().await;
        let shell_addr = format!("127.0.0.1:{}", dispatcher.shell_port());
        let codec = JsonCodec;
        let mut default_link = registry.take("").await.unwrap();

        let task = tokio::spawn(async move {
            dispatcher.run().await;
        });

        let mut client = ClientConnection::connect(&shell_addr).await.unwrap();
        // Addressed to a subshell that was never created.
        client
            .send(codec.serialize(&request("execute_request", Some("ghost"))))
            .await
            .unwrap();
        // A second message without an address goes to the default subshell;
        // its arrival proves the first was dropped, not queued.
        client
            .send(codec.serialize(&request("kernel_info_request", None)))
            .await
            .unwrap();

        let mut msg = default_link.chan.recv().await.unwrap();
        assert_eq!(msg.pop_routing_key(), Some(RoutingKey::Shell));
        let parsed = codec.deserialize(&msg).unwrap();
        assert_eq!(parsed.header.msg_type, "kernel_info_request");

        control
            .request(WireMessage::from_str_frames(&["stop"]))
            .await
            .unwrap();
        task.await.unwrap();
    }
}
