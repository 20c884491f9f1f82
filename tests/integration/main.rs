//! cairn integration test harness.
//!
//! Tests here run whole overlays against each other over an in-memory
//! transport and transfer channel — no sockets, no daemon process. The
//! harness in `infra` wires N `OverlayProtocol` instances into one
//! simulated network; scenarios then exercise lookups, gossip, and
//! liveness end to end.

mod infra;

mod gossip;
mod liveness;
mod lookup;

pub use infra::*;
