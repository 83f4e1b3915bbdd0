//! # Shared netcode core
//!
//! Everything both peers need to simulate the same world frame by frame:
//!
//! - [`simulation::SimulationDriver`] runs a [`physics::PhysicsWorld`] at a
//!   fixed timestep, applying buffered inputs before each step and recording
//!   a [`state::SimulationSnapshot`] after it.
//! - [`input::InputBuffer`] keeps recent per-actor inputs for redundant
//!   sending and for replay.
//! - [`state::StateHistory`] keeps recent snapshots by frame.
//! - [`reconcile::ClientReconciler`] compares authoritative snapshots with the
//!   local prediction and rewinds and replays when they diverge.
//! - [`clock::ClockSync`] estimates the server clock offset from round-trip
//!   probes.
//! - [`protocol::Packet`] is the wire format.
//!
//! The server links this crate to run the authoritative simulation; the
//! client links it to predict ahead of the server with the exact same step.

pub mod actor;
pub mod clock;
pub mod config;
pub mod error;
pub mod input;
pub mod physics;
pub mod protocol;
pub mod reconcile;
pub mod ring_buffer;
pub mod simulation;
pub mod state;

/// Identifier of a simulated object, stable across peers.
pub type ObjectId = u32;

pub use actor::ActorKind;
pub use clock::{ClockSync, ManualClock, MonotonicClock, TimeProbe, TimeReply, TimeSource};
pub use config::{ClockSyncConfig, SimulationConfig};
pub use error::{NetcodeError, Result};
pub use input::{Buttons, CompressedInput, InputBuffer, InputSample};
pub use physics::{BodyDesc, BodyHandle, PhysicsWorld, SimpleWorld, Transform};
pub use protocol::Packet;
pub use reconcile::{ClientReconciler, DirectReason, IgnoreReason, ReconcileOutcome};
pub use ring_buffer::RingBuffer;
pub use simulation::SimulationDriver;
pub use state::{CorrectionThresholds, ObjectState, SimulationSnapshot, StateHistory};
