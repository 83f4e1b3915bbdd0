//! Predicted simulation state for one connected client
//!
//! [`ClientGame`] owns the local [`SimulationDriver`], the reconciler and the
//! clock estimate. It turns incoming packets into state changes and produces
//! the packets the network layer should send; it never touches a socket, so
//! the whole prediction loop can be driven from tests with a manual clock.

use crate::input::{InputManager, InputSource};
use log::{debug, info, warn};
use shared::actor::{actor_body, ActorKind};
use shared::clock::{ClockSync, TimeReply, TimeSource};
use shared::config::{ClockSyncConfig, SimulationConfig};
use shared::error::{NetcodeError, Result};
use shared::input::compress_inputs;
use shared::physics::{BodyDesc, SimpleWorld};
use shared::protocol::{Packet, PROTOCOL_VERSION};
use shared::reconcile::{ClientReconciler, IgnoreReason, ReconcileOutcome};
use shared::simulation::SimulationDriver;
use shared::state::{ObjectState, SimulationSnapshot};
use shared::ObjectId;

/// Frames the client runs ahead of its latency estimate so inputs reach the
/// server before it simulates them.
pub const INPUT_LEAD_MARGIN: u32 = 2;

/// What a received packet did to the local game
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected { client_id: u32, object_id: ObjectId },
    Reconciled(ReconcileOutcome),
    ClockSample(Option<f64>),
    Disconnected(String),
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClientStats {
    pub frame: u32,
    pub snapshots: u64,
    pub corrections: u64,
    pub replayed_frames: u64,
    pub realignments: u64,
    pub clock_offset: f64,
    pub rtt: Option<f64>,
}

pub struct ClientGame<C: TimeSource> {
    driver: SimulationDriver<SimpleWorld>,
    reconciler: ClientReconciler,
    clock: ClockSync<C>,
    input: InputManager,
    client_id: Option<u32>,
    object_id: Option<ObjectId>,
    connect_sent_at: Option<f64>,
    redundant_inputs: usize,
    snapshots: u64,
}

impl<C: TimeSource> ClientGame<C> {
    pub fn new(config: SimulationConfig, clock: C, clock_config: ClockSyncConfig) -> Self {
        let reconciler = ClientReconciler::from_config(&config);
        let redundant_inputs = config.redundant_inputs.max(1);
        Self {
            driver: SimulationDriver::new(SimpleWorld::arena(), config),
            reconciler,
            clock: ClockSync::new(clock, clock_config),
            input: InputManager::new(),
            client_id: None,
            object_id: None,
            connect_sent_at: None,
            redundant_inputs,
            snapshots: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.object_id.is_some()
    }

    pub fn client_id(&self) -> Option<u32> {
        self.client_id
    }

    pub fn object_id(&self) -> Option<ObjectId> {
        self.object_id
    }

    pub fn frame(&self) -> u32 {
        self.driver.frame()
    }

    pub fn driver(&self) -> &SimulationDriver<SimpleWorld> {
        &self.driver
    }

    pub fn reconciler(&self) -> &ClientReconciler {
        &self.reconciler
    }

    pub fn clock(&self) -> &ClockSync<C> {
        &self.clock
    }

    pub fn input(&self) -> &InputManager {
        &self.input
    }

    /// Predicted state of the locally controlled object
    pub fn own_state(&self) -> Option<ObjectState> {
        self.object_id
            .and_then(|object_id| self.driver.object_state(object_id).ok())
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            frame: self.driver.frame(),
            snapshots: self.snapshots,
            corrections: self.reconciler.corrections(),
            replayed_frames: self.reconciler.replayed_frames(),
            realignments: self.reconciler.realignments(),
            clock_offset: self.clock.offset(),
            rtt: self.clock.rtt(),
        }
    }

    /// Builds the connect request and remembers when it was sent, so the
    /// handshake round trip can seed the frame lead.
    pub fn connect_packet(&mut self) -> Packet {
        self.connect_sent_at = Some(self.clock.local_time());
        Packet::Connect {
            client_version: PROTOCOL_VERSION,
        }
    }

    /// Frames to run ahead of the server's reported frame
    pub fn frame_lead(&self) -> u32 {
        let dt = self.driver.config().fixed_dt;
        let rtt = self.clock.rtt().or_else(|| {
            self.connect_sent_at
                .map(|sent| (self.clock.local_time() - sent).max(0.0))
        });
        let latency_frames = rtt.map_or(0, |rtt| (rtt / dt as f64).ceil() as u32);
        latency_frames + INPUT_LEAD_MARGIN
    }

    /// Starts predicting from the server's frame plus the current lead
    pub fn on_connected(
        &mut self,
        client_id: u32,
        object_id: ObjectId,
        server_frame: u32,
    ) -> Result<()> {
        if let Some(previous) = self.object_id.take() {
            self.driver.release_control(previous);
            match self.driver.remove_object(previous) {
                Ok(()) => debug!("Dropped previous object {}", previous),
                Err(e) => debug!("Previous object {} already gone: {}", previous, e),
            }
        }

        let start = server_frame + self.frame_lead();
        self.driver.reset_frame(start);
        if !self.driver.contains_object(object_id) {
            self.driver
                .register_object(object_id, actor_body(object_id), ActorKind::roller())?;
        }
        self.driver.control_object(object_id)?;
        self.driver.record_current()?;
        self.reconciler.reset();

        self.client_id = Some(client_id);
        self.object_id = Some(object_id);
        self.connect_sent_at = None;

        info!(
            "Connected as client {} controlling object {}, predicting from frame {} (server at {})",
            client_id, object_id, start, server_frame
        );
        Ok(())
    }

    pub fn on_disconnected(&mut self) {
        if let Some(object_id) = self.object_id.take() {
            self.driver.release_control(object_id);
        }
        self.client_id = None;
    }

    /// Runs every fixed step due for `wall_dt` seconds, sampling `source`
    /// once per step. Returns the number of steps run.
    pub fn step(&mut self, wall_dt: f64, source: &mut dyn InputSource) -> Result<u32> {
        let Some(object_id) = self.object_id else {
            return Ok(0);
        };

        let input = &mut self.input;
        let result = self.driver.tick_with(wall_dt, |frame| {
            vec![input.sample(source, frame, object_id)]
        });

        match result {
            Ok(steps) => Ok(steps),
            Err(NetcodeError::SimulationStall { executed, .. }) => Ok(executed),
            Err(e) => Err(e),
        }
    }

    /// The last `redundant_inputs` samples, compressed, ready to send
    pub fn outgoing_inputs(&self) -> Option<Packet> {
        let buffer = self.driver.local_inputs(self.object_id?)?;
        if buffer.is_empty() {
            return None;
        }

        let inputs = compress_inputs(&buffer.redundant(self.redundant_inputs));
        Some(Packet::Inputs { inputs })
    }

    /// A time probe if one is due
    pub fn poll_probe(&mut self) -> Option<Packet> {
        if !self.is_connected() || !self.clock.should_probe() {
            return None;
        }
        Some(Packet::TimeProbe(self.clock.begin_probe()))
    }

    pub fn handle_packet(&mut self, packet: Packet) -> Result<ClientEvent> {
        match packet {
            Packet::Connected {
                client_id,
                object_id,
                server_frame,
            } => {
                self.on_connected(client_id, object_id, server_frame)?;
                Ok(ClientEvent::Connected {
                    client_id,
                    object_id,
                })
            }
            Packet::Snapshot {
                server_time,
                snapshot,
                live_objects,
            } => {
                if !self.is_connected() {
                    return Ok(ClientEvent::Ignored);
                }
                let outcome = self.handle_snapshot(server_time, &snapshot, &live_objects)?;
                Ok(ClientEvent::Reconciled(outcome))
            }
            Packet::TimeReply(reply) => Ok(ClientEvent::ClockSample(self.handle_time_reply(&reply))),
            Packet::Disconnected { reason } => {
                warn!("Disconnected by server: {}", reason);
                self.on_disconnected();
                Ok(ClientEvent::Disconnected(reason))
            }
            other => {
                debug!("Ignoring client-bound packet {:?}", other);
                Ok(ClientEvent::Ignored)
            }
        }
    }

    /// Drops objects the server no longer has, registers objects seen for
    /// the first time, then reconciles
    ///
    /// If the server has caught up with or passed the local frame, judged
    /// from the snapshot frame or from the clock estimate of how far the
    /// server has moved since sending it, prediction is realigned instead of
    /// reconciled. Inputs would otherwise reach the server too late.
    pub fn handle_snapshot(
        &mut self,
        server_time: f64,
        snapshot: &SimulationSnapshot,
        live_objects: &[ObjectId],
    ) -> Result<ReconcileOutcome> {
        self.snapshots += 1;

        if self
            .reconciler
            .last_reconciled_frame()
            .is_some_and(|last| snapshot.frame <= last)
        {
            return Ok(ReconcileOutcome::Ignored(IgnoreReason::Duplicate));
        }

        self.remove_departed(live_objects);

        for state in &snapshot.objects {
            if self.driver.contains_object(state.object_id)
                || !live_objects.contains(&state.object_id)
            {
                continue;
            }
            let desc = BodyDesc {
                transform: state.transform,
                ..actor_body(state.object_id)
            };
            self.driver
                .register_object(state.object_id, desc, ActorKind::Passive)?;
            debug!("Discovered object {} from snapshot {}", state.object_id, snapshot.frame);
        }

        let server_frame = self.estimated_server_frame(server_time, snapshot.frame);
        if server_frame >= self.driver.frame() {
            let target = server_frame + self.frame_lead();
            warn!(
                "Prediction fell behind the server (local frame {}, server about {}), realigning to {}",
                self.driver.frame(),
                server_frame,
                target
            );
            return self.reconciler.realign(&mut self.driver, snapshot, target);
        }

        let outcome = self.reconciler.reconcile(&mut self.driver, snapshot)?;
        if let ReconcileOutcome::Corrected { replayed, diverged } = &outcome {
            debug!(
                "Snapshot {} corrected {:?}, replayed {} frames",
                snapshot.frame, diverged, replayed
            );
        }
        Ok(outcome)
    }

    /// The server's current frame: the snapshot frame plus its age once the
    /// clock estimate is usable, the snapshot frame alone before that
    fn estimated_server_frame(&self, server_time: f64, snapshot_frame: u32) -> u32 {
        if !self.clock.is_stable() {
            return snapshot_frame;
        }
        let age = self
            .clock
            .frames_to_rewind(server_time, self.driver.config().fixed_dt);
        snapshot_frame.saturating_add(age)
    }

    fn remove_departed(&mut self, live_objects: &[ObjectId]) {
        let own = self.object_id;
        let departed: Vec<ObjectId> = self
            .driver
            .object_ids()
            .filter(|object_id| Some(*object_id) != own && !live_objects.contains(object_id))
            .collect();

        for object_id in departed {
            match self.driver.remove_object(object_id) {
                Ok(()) => debug!("Object {} left the simulation", object_id),
                Err(e) => debug!("Could not remove object {}: {}", object_id, e),
            }
        }
    }

    pub fn handle_time_reply(&mut self, reply: &TimeReply) -> Option<f64> {
        let offset = self.clock.on_reply(reply);
        if let Some(offset) = offset {
            debug!(
                "Clock offset {:.4}s, rtt {:.1}ms",
                offset,
                self.clock.rtt().unwrap_or(0.0) * 1000.0
            );
        }
        offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::RawInput;
    use assert_approx_eq::assert_approx_eq;
    use glam::Vec3;
    use shared::clock::ManualClock;
    use shared::input::{decompress_inputs, Buttons};

    fn steps(count: f64) -> f64 {
        count * SimulationConfig::default().fixed_dt as f64
    }

    fn new_game() -> (ClientGame<ManualClock>, ManualClock) {
        let clock = ManualClock::new(0.0);
        let game = ClientGame::new(
            SimulationConfig::default(),
            clock.clone(),
            ClockSyncConfig::default(),
        );
        (game, clock)
    }

    fn push_right() -> RawInput {
        RawInput {
            movement: Vec3::X,
            buttons: Buttons::NONE,
        }
    }

    #[test]
    fn test_no_steps_before_connect() {
        let (mut game, _) = new_game();
        let mut source = push_right;

        assert_eq!(game.step(steps(5.5), &mut source).unwrap(), 0);
        assert_eq!(game.frame(), 0);
        assert!(game.outgoing_inputs().is_none());
        assert!(game.poll_probe().is_none());
    }

    #[test]
    fn test_connect_aligns_ahead_of_server() {
        let (mut game, clock) = new_game();
        let dt = SimulationConfig::default().fixed_dt as f64;

        let _ = game.connect_packet();
        clock.advance(dt * 3.5);

        let event = game
            .handle_packet(Packet::Connected {
                client_id: 1,
                object_id: 5,
                server_frame: 100,
            })
            .unwrap();

        assert_eq!(
            event,
            ClientEvent::Connected {
                client_id: 1,
                object_id: 5
            }
        );
        assert_eq!(game.frame(), 100 + 4 + INPUT_LEAD_MARGIN);
        assert!(game.driver().is_controlled(5));
        assert!(game.driver().history().find(game.frame()).is_some());
    }

    #[test]
    fn test_inputs_are_sent_redundantly() {
        let (mut game, _) = new_game();
        game.on_connected(1, 5, 0).unwrap();
        let mut source = push_right;

        let start = game.frame();
        for _ in 0..20 {
            game.step(steps(1.0) + 1e-9, &mut source).unwrap();
        }
        assert_eq!(game.frame(), start + 20);

        let Some(Packet::Inputs { inputs }) = game.outgoing_inputs() else {
            panic!("expected an input packet");
        };
        assert_eq!(inputs.len(), 1);

        let samples = decompress_inputs(&inputs);
        let redundant = SimulationConfig::default().redundant_inputs;
        assert_eq!(samples.len(), redundant);
        assert_eq!(samples.last().unwrap().frame, game.frame());
        assert!(samples.iter().all(|sample| sample.object_id == 5));
    }

    #[test]
    fn test_matching_snapshot_is_in_sync() {
        let (mut game, _) = new_game();
        game.on_connected(1, 5, 0).unwrap();
        let mut source = push_right;
        for _ in 0..10 {
            game.step(steps(1.0) + 1e-9, &mut source).unwrap();
        }

        let frame = game.frame() - 4;
        let predicted = game.driver().history().find(frame).unwrap().clone();
        let outcome = game.handle_snapshot(0.0, &predicted, &[5]).unwrap();

        assert_eq!(outcome, ReconcileOutcome::InSync);
        assert_eq!(game.stats().corrections, 0);
    }

    #[test]
    fn test_unknown_object_is_discovered_and_corrected() {
        let (mut game, _) = new_game();
        game.on_connected(1, 5, 0).unwrap();
        let mut source = push_right;
        for _ in 0..10 {
            game.step(steps(1.0) + 1e-9, &mut source).unwrap();
        }

        let frame = game.frame() - 3;
        let mut authoritative = game.driver().history().find(frame).unwrap().clone();
        authoritative.objects.push(ObjectState {
            object_id: 9,
            transform: shared::physics::Transform::from_position(Vec3::new(5.0, 0.5, 5.0)),
            linear_velocity: Vec3::new(0.0, 0.0, 2.0),
            angular_velocity: Vec3::ZERO,
            force: Vec3::ZERO,
        });
        let authoritative = SimulationSnapshot::new(frame, authoritative.objects);

        let current = game.frame();
        let outcome = game
            .handle_packet(Packet::Snapshot {
                server_time: 0.0,
                snapshot: authoritative,
                live_objects: vec![5, 9],
            })
            .unwrap();

        let ClientEvent::Reconciled(ReconcileOutcome::Corrected { replayed, diverged }) = outcome
        else {
            panic!("expected a correction, got {:?}", outcome);
        };
        assert_eq!(replayed, 3);
        assert_eq!(diverged, vec![9]);
        assert_eq!(game.frame(), current);

        let remote = game.driver().object_state(9).unwrap();
        assert!(remote.transform.position.z > 5.0);
    }

    #[test]
    fn test_departed_objects_are_dropped() {
        let (mut game, _) = new_game();
        game.on_connected(1, 5, 0).unwrap();
        let mut source = push_right;
        for _ in 0..6 {
            game.step(steps(1.0) + 1e-9, &mut source).unwrap();
        }

        let mut first = game.driver().history().find(game.frame() - 2).unwrap().clone();
        first.objects.push(ObjectState::at_rest(
            9,
            shared::physics::Transform::from_position(Vec3::new(4.0, 0.5, 0.0)),
        ));
        game.handle_snapshot(0.0, &first, &[5, 9]).unwrap();
        assert!(game.driver().contains_object(9));

        let mut second = game.driver().history().find(game.frame() - 1).unwrap().clone();
        second.objects.retain(|state| state.object_id == 5);
        game.handle_snapshot(0.0, &second, &[5]).unwrap();

        assert!(!game.driver().contains_object(9));
        assert!(game.driver().contains_object(5));
        assert_eq!(game.driver().object_count(), 1);
    }

    #[test]
    fn test_stale_snapshot_does_not_resurrect_objects() {
        let (mut game, _) = new_game();
        game.on_connected(1, 5, 0).unwrap();
        let mut source = push_right;
        for _ in 0..6 {
            game.step(steps(1.0) + 1e-9, &mut source).unwrap();
        }

        let newer = game.driver().history().find(game.frame() - 1).unwrap().clone();
        game.handle_snapshot(0.0, &newer, &[5]).unwrap();

        let mut older = game.driver().history().find(game.frame() - 3).unwrap().clone();
        older.objects.push(ObjectState::at_rest(
            9,
            shared::physics::Transform::from_position(Vec3::new(4.0, 0.5, 0.0)),
        ));
        let outcome = game.handle_snapshot(0.0, &older, &[5, 9]).unwrap();

        assert_eq!(outcome, ReconcileOutcome::Ignored(IgnoreReason::Duplicate));
        assert!(!game.driver().contains_object(9));
    }

    #[test]
    fn test_snapshot_ahead_after_stall_realigns() {
        let (mut game, _) = new_game();
        game.on_connected(1, 5, 0).unwrap();
        let mut source = push_right;
        for _ in 0..10 {
            game.step(steps(1.0) + 1e-9, &mut source).unwrap();
        }

        // A long hitch only runs the capped number of steps.
        assert_eq!(game.step(0.5, &mut source).unwrap(), 8);
        let stalled_at = game.frame();
        assert_eq!(stalled_at, 20);

        let mut ahead = game.driver().capture_snapshot().unwrap();
        ahead.frame = 40;
        let outcome = game.handle_snapshot(0.0, &ahead, &[5]).unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Realigned {
                from: stalled_at,
                to: 40 + INPUT_LEAD_MARGIN
            }
        );
        assert_eq!(game.frame(), 40 + INPUT_LEAD_MARGIN);
        assert_eq!(game.stats().realignments, 1);

        game.step(steps(1.0) + 1e-9, &mut source).unwrap();
        let recorded = game.driver().history().find(41).unwrap().clone();
        let outcome = game.handle_snapshot(0.0, &recorded, &[5]).unwrap();
        assert_eq!(outcome, ReconcileOutcome::InSync);
    }

    #[test]
    fn test_clock_estimate_detects_lost_lead() {
        let clock = ManualClock::new(0.0);
        let clock_config = ClockSyncConfig {
            warmup_samples: 1,
            ..Default::default()
        };
        let mut game = ClientGame::new(SimulationConfig::default(), clock.clone(), clock_config);
        game.on_connected(1, 5, 0).unwrap();

        let Some(Packet::TimeProbe(probe)) = game.poll_probe() else {
            panic!("expected a probe");
        };
        clock.advance(0.02);
        game.handle_packet(Packet::TimeReply(TimeReply::answer(&probe, 100.01)))
            .unwrap();
        assert!(game.clock().is_stable());

        let mut source = push_right;
        for _ in 0..10 {
            game.step(steps(1.0) + 1e-9, &mut source).unwrap();
        }
        assert_eq!(game.frame(), 12);

        let now = game.clock().server_time();
        let fresh = game.driver().history().find(9).unwrap().clone();
        assert_eq!(
            game.handle_snapshot(now, &fresh, &[5]).unwrap(),
            ReconcileOutcome::InSync
        );

        // Sent a second ago: the server is about 60 frames past it.
        let old = game.driver().history().find(10).unwrap().clone();
        let outcome = game.handle_snapshot(now - 1.0, &old, &[5]).unwrap();

        let lead = game.frame_lead();
        assert_eq!(lead, 2 + INPUT_LEAD_MARGIN);
        assert_eq!(outcome, ReconcileOutcome::Realigned { from: 12, to: 70 + lead });
        assert_eq!(game.frame(), 70 + lead);
    }

    #[test]
    fn test_reconnect_replaces_controlled_object() {
        let (mut game, _) = new_game();
        game.on_connected(1, 5, 0).unwrap();
        game.on_connected(2, 6, 30).unwrap();

        assert!(!game.driver().contains_object(5));
        assert!(game.driver().is_controlled(6));
        assert_eq!(game.object_id(), Some(6));
    }

    #[test]
    fn test_clock_probe_round_trip() {
        let (mut game, clock) = new_game();
        game.on_connected(1, 5, 0).unwrap();

        let Some(Packet::TimeProbe(probe)) = game.poll_probe() else {
            panic!("expected a probe");
        };
        assert!(game.poll_probe().is_none());

        clock.advance(0.1);
        let reply = TimeReply::answer(&probe, 10.05);
        let event = game.handle_packet(Packet::TimeReply(reply)).unwrap();

        let ClientEvent::ClockSample(Some(offset)) = event else {
            panic!("expected an accepted sample");
        };
        assert_approx_eq!(offset, 10.0, 1e-9);
        assert_approx_eq!(game.stats().rtt.unwrap(), 0.1, 1e-9);
    }

    #[test]
    fn test_disconnect_stops_prediction() {
        let (mut game, _) = new_game();
        game.on_connected(1, 5, 0).unwrap();

        let event = game
            .handle_packet(Packet::Disconnected {
                reason: "Server full".into(),
            })
            .unwrap();

        assert_eq!(event, ClientEvent::Disconnected("Server full".into()));
        assert!(!game.is_connected());
        let mut source = push_right;
        assert_eq!(game.step(steps(3.5), &mut source).unwrap(), 0);
    }
}
