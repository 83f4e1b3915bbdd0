//! Authoritative simulation state for the server
//!
//! The server runs the same [`SimulationDriver`] as the clients. Each fixed
//! step takes at most one input per client, drained from the [`ClientManager`]
//! before the tick starts, steps the world, and on the broadcast cadence
//! yields a snapshot filtered down to the objects that are actually moving.

use crate::client_manager::ClientManager;
use log::{debug, info};
use shared::actor::{actor_body, ActorKind};
use shared::config::SimulationConfig;
use shared::error::{NetcodeError, Result};
use shared::input::InputSample;
use shared::physics::{BodyHandle, SimpleWorld};
use shared::simulation::SimulationDriver;
use shared::state::SimulationSnapshot;
use shared::ObjectId;
use std::collections::BTreeMap;
use std::ops::RangeInclusive;

pub struct ServerGame {
    driver: SimulationDriver<SimpleWorld>,
    broadcast_interval: u32,
    min_broadcast_speed: f32,
}

impl ServerGame {
    pub fn new(config: SimulationConfig) -> Self {
        let broadcast_interval = config.broadcast_interval.max(1);
        let min_broadcast_speed = config.min_broadcast_speed;
        Self {
            driver: SimulationDriver::new(SimpleWorld::arena(), config),
            broadcast_interval,
            min_broadcast_speed,
        }
    }

    pub fn frame(&self) -> u32 {
        self.driver.frame()
    }

    pub fn driver(&self) -> &SimulationDriver<SimpleWorld> {
        &self.driver
    }

    pub fn object_count(&self) -> usize {
        self.driver.object_count()
    }

    /// Every object that still exists, sorted. Sent with each snapshot so
    /// clients can drop bodies whose owners have gone.
    pub fn live_objects(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self.driver.object_ids().collect();
        ids.sort_unstable();
        ids
    }

    /// Creates the pawn a newly connected client will drive
    pub fn spawn_actor(&mut self, object_id: ObjectId) -> Result<BodyHandle> {
        let handle = self
            .driver
            .register_object(object_id, actor_body(object_id), ActorKind::roller())?;
        info!("Spawned object {} at frame {}", object_id, self.driver.frame());
        Ok(handle)
    }

    pub fn despawn_actor(&mut self, object_id: ObjectId) {
        match self.driver.remove_object(object_id) {
            Ok(()) => info!("Removed object {}", object_id),
            Err(e) => debug!("Despawn of object {} skipped: {}", object_id, e),
        }
    }

    /// Frames the next [`ServerGame::advance_queued`] call with `wall_dt`
    /// will produce. Empty when no step is due.
    pub fn frames_due(&self, wall_dt: f64) -> RangeInclusive<u32> {
        let first = self.driver.frame() + 1;
        first..=first + self.driver.pending_steps(wall_dt) - 1
    }

    /// Runs every fixed step due for `wall_dt` seconds, pulling inputs
    /// straight from `clients`
    pub fn advance(
        &mut self,
        wall_dt: f64,
        clients: &mut ClientManager,
    ) -> Result<Option<SimulationSnapshot>> {
        let queued = clients.drain_frames(self.frames_due(wall_dt));
        self.advance_queued(wall_dt, queued)
    }

    /// Runs every fixed step due for `wall_dt` seconds with inputs drained
    /// ahead of time, keyed by the frame they belong to
    ///
    /// Returns the snapshot to broadcast if a broadcast frame was produced.
    /// A stall is already logged by the driver; the steps it did run still
    /// count.
    pub fn advance_queued(
        &mut self,
        wall_dt: f64,
        mut queued: BTreeMap<u32, Vec<InputSample>>,
    ) -> Result<Option<SimulationSnapshot>> {
        let start = self.driver.frame();

        match self
            .driver
            .tick_with(wall_dt, |frame| queued.remove(&frame).unwrap_or_default())
        {
            Ok(_) | Err(NetcodeError::SimulationStall { .. }) => {}
            Err(e) => return Err(e),
        }

        Ok(self.broadcast_since(start))
    }

    /// Newest broadcast-cadence snapshot produced after `since`, filtered
    fn broadcast_since(&self, since: u32) -> Option<SimulationSnapshot> {
        let frame = (since + 1..=self.driver.frame())
            .rev()
            .find(|frame| frame % self.broadcast_interval == 0)?;

        self.driver
            .history()
            .find(frame)
            .map(|snapshot| snapshot.moving_only(self.min_broadcast_speed))
    }
}
