//! Client connection management and per-client input queues
//!
//! This module owns everything the network receive path is allowed to touch:
//! - Client connection lifecycle (connect, disconnect, timeout)
//! - The client id to object id mapping
//! - One frame-ordered input buffer per client, filled straight from
//!   decompressed input packets
//! - A per-client watermark recording the last frame handed to the simulation
//!
//! The server keeps this behind its own lock. The tick loop holds it only
//! long enough to drain the inputs due this tick with [`ClientManager::drain_frames`]
//! and steps physics after releasing it, so input arrival waits on a queue
//! copy rather than on the physics step.

use log::{debug, info, warn};
use shared::config::CLIENT_TIMEOUT_SECS;
use shared::input::{InputBuffer, InputSample};
use shared::ObjectId;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::time::{Duration, Instant};

/// Represents a connected client and the inputs it has sent
#[derive(Debug)]
pub struct Client {
    /// Unique client identifier assigned by the server
    pub id: u32,
    /// Network address for sending responses
    pub addr: SocketAddr,
    /// The simulated object this client drives
    pub object_id: ObjectId,
    /// Last time we received any packet from this client
    pub last_seen: Instant,
    /// Highest frame whose input has been handed to the simulation
    pub last_consumed_frame: Option<u32>,
    /// Received inputs ordered by frame, duplicates collapsed
    pub inputs: InputBuffer,
}

impl Client {
    pub fn new(id: u32, addr: SocketAddr, object_id: ObjectId, input_capacity: usize) -> Self {
        Self {
            id,
            addr,
            object_id,
            last_seen: Instant::now(),
            last_consumed_frame: None,
            inputs: InputBuffer::new(input_capacity),
        }
    }

    /// Buffers received samples and returns how many were kept
    ///
    /// Redundant sending means most samples arrive several times; a repeat
    /// replaces the stored copy. Samples at or before the watermark arrived
    /// too late to be simulated and are dropped, as are samples naming an
    /// object this client does not control.
    pub fn add_inputs(&mut self, samples: impl IntoIterator<Item = InputSample>) -> usize {
        self.last_seen = Instant::now();

        let mut kept = 0;
        for sample in samples {
            if sample.object_id != self.object_id {
                warn!(
                    "Client {} sent input for object {} but controls {}",
                    self.id, sample.object_id, self.object_id
                );
                continue;
            }
            if self
                .last_consumed_frame
                .is_some_and(|consumed| sample.frame <= consumed)
            {
                continue;
            }
            if self.inputs.insert_received(sample) {
                kept += 1;
            }
        }
        kept
    }

    /// Takes the input to apply for the step producing `frame`
    ///
    /// Returns the newest buffered sample with a frame at or before `frame`
    /// that has not been consumed yet, and advances the watermark past it.
    /// Older unconsumed samples were superseded and are skipped.
    pub fn take_ready(&mut self, frame: u32) -> Option<InputSample> {
        let pending = self.inputs.pending_after(self.last_consumed_frame, frame);
        let newest = *pending.last()?;
        if pending.len() > 1 {
            debug!(
                "Client {} skipped {} late inputs before frame {}",
                self.id,
                pending.len() - 1,
                newest.frame
            );
        }
        self.last_consumed_frame = Some(newest.frame);
        Some(newest)
    }

    /// Checks if the client has exceeded the connection timeout
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Manages all connected clients and their input queues
///
/// Besides capacity limits and address lookup, the manager issues one object
/// id per client and keeps the mapping in both directions so snapshots and
/// inputs can be routed without touching the simulation.
pub struct ClientManager {
    /// Connected clients indexed by their unique ID
    clients: HashMap<u32, Client>,
    object_owners: HashMap<ObjectId, u32>,
    next_client_id: u32,
    next_object_id: ObjectId,
    max_clients: usize,
    input_capacity: usize,
    timeout: Duration,
}

impl ClientManager {
    /// Creates a new client manager with the specified capacity limit
    pub fn new(max_clients: usize, input_capacity: usize) -> Self {
        Self {
            clients: HashMap::new(),
            object_owners: HashMap::new(),
            next_client_id: 1,
            next_object_id: 1,
            max_clients,
            input_capacity,
            timeout: Duration::from_secs(CLIENT_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Attempts to add a new client connection
    ///
    /// Returns the new client id and the object id it will drive, or None if
    /// the server is at capacity.
    pub fn add_client(&mut self, addr: SocketAddr) -> Option<(u32, ObjectId)> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;
        let object_id = self.next_object_id;
        self.next_object_id += 1;

        let client = Client::new(client_id, addr, object_id, self.input_capacity);
        info!(
            "Client {} connected from {} controlling object {}",
            client_id, addr, object_id
        );
        self.clients.insert(client_id, client);
        self.object_owners.insert(object_id, client_id);

        Some((client_id, object_id))
    }

    /// Removes a client and returns the object it controlled
    pub fn remove_client(&mut self, client_id: &u32) -> Option<ObjectId> {
        let client = self.clients.remove(client_id)?;
        self.object_owners.remove(&client.object_id);
        info!("Client {} disconnected", client.id);
        Some(client.object_id)
    }

    /// Finds a client ID by their network address
    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<u32> {
        self.clients
            .iter()
            .find(|(_, client)| client.addr == addr)
            .map(|(id, _)| *id)
    }

    pub fn client(&self, client_id: u32) -> Option<&Client> {
        self.clients.get(&client_id)
    }

    pub fn object_for_client(&self, client_id: u32) -> Option<ObjectId> {
        self.clients.get(&client_id).map(|client| client.object_id)
    }

    pub fn client_for_object(&self, object_id: ObjectId) -> Option<u32> {
        self.object_owners.get(&object_id).copied()
    }

    /// Refreshes the activity timestamp for non-input traffic
    pub fn touch(&mut self, client_id: u32) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.last_seen = Instant::now();
        }
    }

    /// Buffers decompressed inputs for a client
    ///
    /// Returns None if the client id is unknown, otherwise the number of
    /// samples kept.
    pub fn add_inputs(
        &mut self,
        client_id: u32,
        samples: impl IntoIterator<Item = InputSample>,
    ) -> Option<usize> {
        self.clients
            .get_mut(&client_id)
            .map(|client| client.add_inputs(samples))
    }

    /// Collects the input each client wants applied on the step producing
    /// `frame`, ordered by object id so the simulation sees a stable order.
    pub fn drain_ready(&mut self, frame: u32) -> Vec<InputSample> {
        let mut ready: Vec<InputSample> = self
            .clients
            .values_mut()
            .filter_map(|client| client.take_ready(frame))
            .collect();
        ready.sort_by_key(|sample| sample.object_id);
        ready
    }

    /// Drains the inputs for every frame in `frames`, as consecutive
    /// [`ClientManager::drain_ready`] calls would. Frames with nothing ready
    /// are left out of the map.
    pub fn drain_frames(
        &mut self,
        frames: RangeInclusive<u32>,
    ) -> BTreeMap<u32, Vec<InputSample>> {
        let mut queued = BTreeMap::new();
        for frame in frames {
            let ready = self.drain_ready(frame);
            if !ready.is_empty() {
                queued.insert(frame, ready);
            }
        }
        queued
    }

    /// Removes timed-out clients, returning their ids and objects
    pub fn check_timeouts(&mut self) -> Vec<(u32, ObjectId)> {
        let timeout = self.timeout;
        let timed_out: Vec<u32> = self
            .clients
            .iter()
            .filter(|(_, client)| client.is_timed_out(timeout))
            .map(|(id, _)| *id)
            .collect();

        timed_out
            .into_iter()
            .filter_map(|client_id| {
                self.remove_client(&client_id)
                    .map(|object_id| (client_id, object_id))
            })
            .collect()
    }

    /// Gets all client IDs and their network addresses for broadcasting
    pub fn get_client_addrs(&self) -> Vec<(u32, SocketAddr)> {
        self.clients
            .iter()
            .map(|(id, client)| (*id, client.addr))
            .collect()
    }

    /// Returns the number of currently connected clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns true if no clients are currently connected
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
