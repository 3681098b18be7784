//! Device module
//!
//! A device is the local view of one remote peer: its identity, its
//! pairing state, at most one reachable link and the plugins its packets
//! are routed to.
//!
//! This module contains:
//! - `pairing`: the pure pairing state machine
//! - `actor`: the per-device task and its `DeviceHandle`
//! - `events`: events a device reports to its host

pub mod actor;
pub mod events;
pub mod pairing;

pub use actor::{Device, DeviceHandle, DeviceRecord, DeviceSnapshot, PAIRING_TAG};
pub use events::DeviceEvent;
pub use pairing::{PairState, PairingAction, PairingInput, PairingSignal, PairingStateMachine};
