//! # Authoritative Server Library
//!
//! This library runs the authoritative side of the rollback netcode: the one
//! simulation whose results every client ultimately conforms to.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Simulation
//! The server steps the same fixed-timestep [`shared::SimulationDriver`] and
//! deterministic physics world the clients predict with. Each fixed step
//! applies at most one input per client, for the frame being produced or
//! the newest one that arrived late.
//!
//! ### Client Management
//! Handles the complete lifecycle of client connections:
//! - Connection establishment and object assignment (one pawn per client)
//! - Buffering of redundant, compressed input packets by frame number
//! - Disconnection and timeout cleanup, including despawning the pawn
//!
//! ### Snapshot Broadcasting
//! Every `broadcast_interval` frames the server sends the recorded snapshot
//! for that frame, minus objects at rest, together with its clock reading.
//! Clients compare it against their own prediction for the same frame.
//!
//! ### Clock Probes
//! Time probes are answered directly from the receive task so the reply
//! timestamp is taken as close to arrival as possible.
//!
//! ## Concurrency
//!
//! The receive task never touches the physics world. Inputs and the
//! client/object id mapping live in the [`client_manager::ClientManager`]
//! behind an async `RwLock`; the simulation is owned by the game loop alone.
//!
//! ## Module Organization
//!
//! - `client_manager`: connections, id mapping, per-client input buffers
//! - `game`: the authoritative driver, spawning and broadcast cadence
//! - `network`: UDP tasks and the main loop
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::Server;
//! use shared::SimulationConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = Server::new("127.0.0.1:8080", SimulationConfig::default(), 32).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod game;
pub mod network;
