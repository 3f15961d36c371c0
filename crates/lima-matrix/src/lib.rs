//! # lima-matrix
//!
//! The Matrix side of the bridge: appservice transaction server, per-ghost
//! intent clients for the client-server API, and operator-facing reporting
//! (bridge-state pings and message send checkpoints).
//!
//! Matrix identifiers (mxids, room ids, event ids) are opaque strings here.

pub mod appservice;
pub mod error;
pub mod intent;
pub mod report;
pub mod types;

pub use appservice::{Appservice, transaction_router};
pub use error::MatrixError;
pub use intent::Intent;
pub use report::{BridgeState, BridgeStateEvent, CheckpointStatus, MessageSendCheckpoint};
