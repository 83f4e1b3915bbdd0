//! Wire protocol shared by client and server.
//!
//! Every datagram carries exactly one bincode-encoded [`Packet`].

use crate::clock::{TimeProbe, TimeReply};
use crate::input::CompressedInput;
use crate::state::SimulationSnapshot;
use crate::ObjectId;
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

/// Largest datagram either side will send or accept.
pub const MAX_PACKET_SIZE: usize = 65_536;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    // client -> server
    Connect {
        client_version: u32,
    },
    /// Redundant, run-length compressed input history for the sender's actor.
    Inputs {
        inputs: Vec<CompressedInput>,
    },
    TimeProbe(TimeProbe),
    Disconnect,

    // server -> client
    Connected {
        client_id: u32,
        object_id: ObjectId,
        server_frame: u32,
    },
    /// `snapshot` only carries moving objects, so `live_objects` lists every
    /// object that still exists. Clients drop bodies missing from it.
    Snapshot {
        server_time: f64,
        snapshot: SimulationSnapshot,
        live_objects: Vec<ObjectId>,
    },
    TimeReply(TimeReply),
    Disconnected {
        reason: String,
    },
}

impl Packet {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Packet, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
