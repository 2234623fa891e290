//! Coordination core of a two-node synchronously replicated block device:
//! transfer log + epoch barriers, the replication state machine, the
//! two-channel wire protocol, and the worker/sender/receiver/asender
//! scheduling model that ties them together.
//!
//! Block-layer glue, on-disk metadata/bitmap/activity-log formats, and the
//! administration surface are external collaborators represented here only
//! as trait boundaries ([`collaborators`]).

#[macro_use]
extern crate log;

pub mod asender;
pub mod channel;
pub mod collaborators;
pub mod config;
pub mod context;
pub mod device;
pub mod ee;
pub mod error;
pub mod gencounts;
pub mod handshake;
pub mod metrics;
pub mod pending;
pub mod pipeline;
pub mod pool;
pub mod receiver;
pub mod resync;
pub mod state;
pub mod tl;
pub mod wire;
pub mod worker;

pub use config::Config;
pub use device::Device;
pub use error::CoreError;
