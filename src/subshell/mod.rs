//! Subshell worker: the worker side of one internal duplex channel.
//!
//! A [`SubshellWorker`] demultiplexes its channel into the shell and control
//! streams using two FIFO queues, and provides the synchronous stdin
//! round-trip that lets a kernel context request input from its client in
//! the middle of handling a request.
//!
//! There is no stored state machine: every operation derives its behavior
//! from the two queue occupancies and channel readiness, evaluated fresh.
//! That discipline is the ordering contract of the subsystem — a buffered
//! control message is always observed before buffered shell work, and
//! control/shell frames arriving during a stdin wait are queued, never lost.
//!
//! Each worker is owned and driven by exactly one task; no operation here is
//! reentrant.

use std::collections::VecDeque;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::dispatch::{SubshellRegistry, WorkerLink};
use crate::protocol::{KernelMessage, SharedCodec};
use crate::transport::{ChannelClosed, Duplex};
use crate::wire::{RoutingKey, WireMessage};

/// The two streams a worker can report ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubChannel {
    Shell,
    Control,
}

/// Failure of a stdin round-trip.
#[derive(Debug, Error)]
pub enum StdinError {
    /// The internal channel was torn down while waiting for the reply.
    #[error("internal channel closed during stdin wait")]
    Disconnected,
    /// The deadline passed before a stdin-tagged reply arrived.
    #[error("stdin reply deadline exceeded")]
    DeadlineExceeded,
    /// A stdin-tagged reply arrived but did not deserialize.
    #[error("stdin reply failed to deserialize")]
    Malformed,
}

/// Worker side of one subshell channel. See the module docs.
pub struct SubshellWorker {
    chan: Duplex,
    iopub: mpsc::UnboundedSender<WireMessage>,
    codec: SharedCodec,
    shell_queue: VecDeque<WireMessage>,
    control_queue: VecDeque<WireMessage>,
}

impl SubshellWorker {
    /// Claim the worker end for subshell `id` from the registry.
    ///
    /// `None` if the subshell does not exist or its link was already taken.
    pub async fn connect(registry: &SubshellRegistry, id: &str, codec: SharedCodec) -> Option<Self> {
        registry.take(id).await.map(|link| Self::new(link, codec))
    }

    #[must_use]
    pub fn new(link: WorkerLink, codec: SharedCodec) -> Self {
        Self {
            chan: link.chan,
            iopub: link.iopub,
            codec,
            shell_queue: VecDeque::new(),
            control_queue: VecDeque::new(),
        }
    }

    /// Report which stream has work, waiting up to `timeout` for the channel.
    ///
    /// Already-buffered control wins over everything; buffered shell wins
    /// over touching the channel. Otherwise one frame set is received and
    /// classified by routing key. `None` on timeout, channel close, or an
    /// unrecognized key; [`Self::is_closed`] tells closure from timeout.
    pub async fn poll_channels(&mut self, timeout: Duration) -> Option<SubChannel> {
        if !self.control_queue.is_empty() {
            return Some(SubChannel::Control);
        }
        if !self.shell_queue.is_empty() {
            return Some(SubChannel::Shell);
        }
        match time::timeout(timeout, self.chan.recv()).await {
            Ok(Some(msg)) => self.classify(msg),
            Ok(None) => {
                debug!("subshell channel closed");
                None
            }
            Err(_) => None,
        }
    }

    /// Queue a received frame set on the stream named by its routing key.
    fn classify(&mut self, mut msg: WireMessage) -> Option<SubChannel> {
        match msg.pop_routing_key() {
            Some(RoutingKey::Shell) => {
                self.shell_queue.push_back(msg);
                Some(SubChannel::Shell)
            }
            Some(RoutingKey::Control) => {
                self.control_queue.push_back(msg);
                Some(SubChannel::Control)
            }
            Some(RoutingKey::Stdin) => {
                // A stdin reply outside send_stdin has no waiter.
                warn!("stdin-tagged frame outside a stdin wait, dropped");
                None
            }
            None => {
                warn!("frame with unrecognized routing key, dropped");
                None
            }
        }
    }

    /// True once the dispatcher end of the channel has been dropped.
    ///
    /// Buffered messages still drain after closure; a driving loop should
    /// stop once this is true *and* `poll_channels` reports nothing left.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.chan.is_closed()
    }

    /// Pop and deserialize the oldest shell message.
    pub fn read_shell(&mut self) -> Option<KernelMessage> {
        let msg = self.shell_queue.pop_front()?;
        self.codec.deserialize(&msg)
    }

    /// Pop the oldest control message and return its payload string.
    pub fn read_controller(&mut self) -> Option<String> {
        let mut msg = self.control_queue.pop_front()?;
        msg.pop_front_str()
    }

    /// Send a shell reply back toward the public shell endpoint.
    pub fn send_shell(&self, mut msg: WireMessage) -> Result<(), ChannelClosed> {
        msg.tag(RoutingKey::Shell);
        self.chan.send(msg)
    }

    /// Send a single-frame control reply toward the control channel.
    pub fn send_controller(&self, payload: &str) -> Result<(), ChannelClosed> {
        let mut msg = WireMessage::from_str_frames(&[payload]);
        msg.tag(RoutingKey::Control);
        self.chan.send(msg)
    }

    /// Synchronous stdin round-trip: send an input request and block until
    /// the stdin-tagged reply arrives.
    ///
    /// Control- and shell-tagged frames observed while waiting are queued so
    /// they surface on later `poll_channels`/`read_*` calls — an interrupt
    /// arriving mid-wait is never lost. `deadline` bounds the whole wait;
    /// `None` waits until the reply arrives or the channel is torn down.
    pub async fn send_stdin(
        &mut self,
        mut msg: WireMessage,
        deadline: Option<Duration>,
    ) -> Result<KernelMessage, StdinError> {
        msg.tag(RoutingKey::Stdin);
        self.chan.send(msg).map_err(|_| StdinError::Disconnected)?;

        let deadline = deadline.map(|d| Instant::now() + d);
        loop {
            let received = match deadline {
                Some(at) => time::timeout_at(at, self.chan.recv())
                    .await
                    .map_err(|_| StdinError::DeadlineExceeded)?,
                None => self.chan.recv().await,
            };
            let mut reply = received.ok_or(StdinError::Disconnected)?;
            match reply.pop_routing_key() {
                Some(RoutingKey::Stdin) => {
                    return self
                        .codec
                        .deserialize(&reply)
                        .ok_or(StdinError::Malformed);
                }
                Some(RoutingKey::Control) => self.control_queue.push_back(reply),
                Some(RoutingKey::Shell) => self.shell_queue.push_back(reply),
                None => warn!("frame with unrecognized routing key during stdin wait, dropped"),
            }
        }
    }

    /// Fire-and-forget publication on the outward IOPub channel.
    pub fn publish(&self, msg: WireMessage) {
        if self.iopub.send(msg).is_err() {
            debug!("publication channel closed, message dropped");
        }
    }

    /// Drain everything currently queued on the internal channel, invoking
    /// `listener` for each message that deserializes, and sleeping
    /// `polling_interval` between drains.
    ///
    /// Best-effort: a send racing the drain may be missed. Used to flush
    /// in-flight traffic during teardown or abort.
    pub async fn abort_queue<F>(&mut self, mut listener: F, polling_interval: Duration)
    where
        F: FnMut(KernelMessage),
    {
        let mut next = self.chan.try_recv();
        while let Some(mut msg) = next {
            // The routing key is transport framing, not payload.
            msg.pop_routing_key();
            if let Some(parsed) = self.codec.deserialize(&msg) {
                listener(parsed);
            }
            // Sleep only between drains; the last message adds no dead time.
            next = self.chan.try_recv();
            if next.is_some() {
                time::sleep(polling_interval).await;
            }
        }
    }
}
