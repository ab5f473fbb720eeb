//! scbridge - scene-edit authoring bridge.
//!
//! Viewer sessions accumulate scene edits into a [`ChangeSet`] and submit it
//! over a WebSocket. The server hands each submission to a bounded pool of
//! workers, each of which runs the native authoring executable once, and
//! relays the process's stdout back to the submitting session line by line.
//!
//! # Architecture
//!
//! - **changeset** - Per-session edit accumulator and payload format
//! - **transport** - WebSocket server, per-session loop and client
//! - **bridge** - Worker pool, process invocation and line reassembly
//! - **protocol** - Event envelope shared by client and server
//!
//! # Modules
//!
//! - [`changeset`] - [`ChangeSetAccumulator`] and the viewer collaborator traits
//! - [`bridge`] - [`ProcessBridge`] and [`LineReassembler`]
//! - [`transport`] - [`Server`] and [`ChannelClient`]
//! - [`config`] - Configuration loading

pub mod bridge;
pub mod changeset;
pub mod config;
pub mod constants;
pub mod protocol;
pub mod transport;

pub use bridge::{
    BridgeConfig, BridgeEvent, LineReassembler, Outcome, PayloadDelivery, ProcessBridge,
    Submission, SubmissionId, SubmitError,
};
pub use changeset::{ChangeSet, ChangeSetAccumulator, ChangeSetError, NodeId};
pub use config::Config;
pub use protocol::{ClientMessage, ServerMessage};
pub use transport::{ChannelClient, Server, TransportError};
