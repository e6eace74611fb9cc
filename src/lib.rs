#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

//! shellmux library — the subshell message-routing core of a kernel
//! communication server.
//!
//! One logical shell identity is multiplexed across any number of
//! concurrently executing subshells. The [`dispatch::ShellDispatcher`] owns
//! the public shell and stdin endpoints plus one internal duplex channel per
//! subshell; each [`subshell::SubshellWorker`] demultiplexes its channel into
//! shell/control streams and provides the blocking stdin round-trip. The
//! in-band control plane creates and destroys subshells and signals
//! shutdown.
//!
//! Key building blocks:
//! - `wire` — multipart messages and the shell/control/stdin routing keys
//! - `protocol` — kernel-message envelope and the `Codec` collaborator seam
//! - `transport` — public router endpoints, in-process duplex channels
//! - `dispatch` — the dispatcher, subshell pool, and control-command protocol
//! - `subshell` — per-subshell worker with FIFO demultiplexing queues
//! - `config` — configuration loading

pub mod config;
pub mod dispatch;
pub mod protocol;
pub mod subshell;
pub mod transport;
pub mod wire;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use dispatch::{ControlHandle, DispatchError, ShellDispatcher, SubshellRegistry, WorkerLink};
pub use protocol::{Codec, JsonCodec, KernelMessage, MessageHeader, SharedCodec};
pub use subshell::{StdinError, SubChannel, SubshellWorker};
pub use wire::{RoutingKey, WireMessage};
