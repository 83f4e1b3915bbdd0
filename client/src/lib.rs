//! # Predicting Client Library
//!
//! This library provides the client half of the rollback netcode: it predicts
//! the local pawn immediately from its own inputs and quietly corrects itself
//! whenever the server's authoritative history disagrees.
//!
//! ## Architecture Overview
//!
//! ### Client-Side Prediction
//! The client steps the same fixed-timestep [`shared::SimulationDriver`] as
//! the server, running a few frames ahead of it. Every sampled input is
//! applied locally at once and buffered by frame number.
//!
//! ### Server Reconciliation
//! Each authoritative snapshot is compared against the prediction recorded
//! for the same frame. When any object is off by more than the correction
//! thresholds, the world is reset to the server's state for that frame and
//! every later frame is replayed with the buffered inputs.
//!
//! ### Clock Synchronization
//! Periodic time probes feed a [`shared::ClockSync`] estimate of the server
//! clock offset and round trip, which decides how far ahead of the server
//! the client predicts.
//!
//! ## Module Organization
//!
//! ### Game Module (`game`)
//! Socket-free client state:
//! - Frame alignment on connect
//! - Input sampling, buffering and redundant sending
//! - Snapshot handling and discovery of remote objects
//! - Clock probe bookkeeping
//!
//! ### Input Module (`input`)
//! - The [`input::InputSource`] seam for anything that produces inputs
//! - A seeded bot for headless runs
//! - Frame stamping and change detection
//!
//! ### Network Module (`network`)
//! - UDP socket handling and the main client loop
//! - An optional link conditioner adding latency and packet loss
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::input::BotInput;
//! use client::network::{Client, LinkConditioner};
//! use shared::SimulationConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let source = Box::new(BotInput::new(7));
//!     let link = LinkConditioner::new(100, 0.05, 7);
//!     let mut client = Client::new("127.0.0.1:8080", SimulationConfig::default(), source, link).await?;
//!     client.run().await?;
//!     Ok(())
//! }
//! ```

pub mod game;
pub mod input;
pub mod network;
