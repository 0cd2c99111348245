//! Core engine of a store-and-forward DTN bundle protocol agent.
//!
//! A *bundle* is a self-contained unit of application data decorated with
//! routing, lifetime, integrity and custody-transfer metadata. This crate
//! implements the agent core for environments where end-to-end connectivity
//! is intermittent: bundles are originated, retained, forwarded hop by hop,
//! and retransmitted until a downstream node confirms it has taken *custody*
//! of them.
//!
//! ## Subsystems
//!
//! * **Per-channel protocol engine** ([`channel`]) - a state machine that
//!   originates ([`Channel::store`]), emits ([`Channel::load`]), parses and
//!   dispatches ([`Channel::process`]) and delivers ([`Channel::accept`])
//!   bundles. In-flight custody-bearing bundles are tracked in a fixed-size
//!   *active table* keyed by custody id; timed-out entries are retransmitted
//!   with a configurable wrap-around policy, and custody acceptance is
//!   confirmed to upstream nodes through *aggregate custody signals* that
//!   acknowledge whole runs of custody ids in a single bundle.
//! * **Custody/cache subsystem** ([`cache`]) - the storage plane used by
//!   BPv7 services: retained bundles are kept in a refcounted arena indexed
//!   by destination, by action time and by a hash of (source flow, sequence)
//!   for duplicate detection and custody-signal lookup. A per-entry state
//!   machine drives egress, retransmission and the custody handoff between
//!   agents.
//!
//! The byte-level wire formats live in [`codec`]: BPv6 blocks are
//! SDNV-encoded at fixed scratch offsets, BPv7 blocks are CBOR-encoded and
//! CRC-protected.
//!
//! ## What this crate is not
//!
//! There is no routing protocol (routes are supplied by the host), no
//! cryptographic key management (integrity is a CRC or keyed digest chosen
//! at configuration), no reassembly of received fragments, and no endpoint
//! schemes other than `ipn:`. Convergence-layer adapters (the transports
//! below the bundle layer) interact with the engine only through the byte
//! buffers passed to `load`/`process`. Durable storage is pluggable behind
//! the [`storage::BundleStore`] trait; an in-memory adapter ships as the
//! reference implementation.

pub mod active_table;
pub mod cache;
pub mod channel;
pub mod codec;
pub mod eid;
pub mod error;
pub mod runset;
pub mod sdnv;
pub mod storage;
pub mod time;

pub use channel::{Agent, Channel, ChannelConfig, ChannelHandle, ChannelStats};
pub use eid::Eid;
pub use error::{BpError, BpResult, StatusFlags};
pub use storage::{BundleStore, StorageService, Timeout};
