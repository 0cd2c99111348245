//! The per-channel protocol engine.
//!
//! A channel is the runtime state of one local endpoint: an outbound bundle
//! template, three storage queues (data, delivered payloads, custody
//! signals), the active table of in-flight custody-bearing bundles, and the
//! open custody-signal accumulators. Independent tasks may call
//! [`Channel::store`], [`Channel::load`], [`Channel::process`] and
//! [`Channel::accept`] concurrently; each critical region is guarded by its
//! own lock and no two channel locks are ever held across a storage call.

mod config;
mod dacs;
mod engine;
mod registry;
mod stats;
mod template;

pub use config::{ChannelConfig, ChannelOption, ChannelOptions, WrapResponse};
pub use engine::{route_info, Channel, Payload};
pub use registry::{Agent, ChannelHandle};
pub use stats::ChannelStats;
