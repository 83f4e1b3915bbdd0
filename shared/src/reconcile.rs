//! Client-side reconciliation against authoritative snapshots.
//!
//! When the server's state for frame F arrives, the client compares it with
//! what it predicted for F. If any object is off by more than the configured
//! thresholds, the world is reset to the server's F-state and every frame
//! from F+1 up to the present is re-simulated with the same locally buffered
//! inputs. Snapshots that are duplicated, reordered, too old to replay, or
//! ahead of the local frame are handled without failing.
//!
//! A client whose frame counter has fallen behind the server, after a stall
//! for instance, is moved forward again with [`ClientReconciler::realign`].

use crate::config::SimulationConfig;
use crate::error::{NetcodeError, Result};
use crate::physics::PhysicsWorld;
use crate::simulation::SimulationDriver;
use crate::state::{CorrectionThresholds, SimulationSnapshot};
use crate::ObjectId;
use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// A replay was already in progress.
    Reconciling,
    /// Frame at or before the last reconciled frame.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectReason {
    /// The predicted snapshot for that frame has been evicted.
    HistoryMiss,
    /// More frames behind than a replay is allowed to cover.
    Stale,
    /// Ahead of the local frame counter.
    FutureFrame,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Ignored(IgnoreReason),
    /// Prediction matched; nothing was touched.
    InSync,
    Corrected {
        replayed: u32,
        diverged: Vec<ObjectId>,
    },
    AppliedDirectly(DirectReason),
    /// The frame counter jumped from `from` to `to` after applying the
    /// snapshot and simulating forward from it.
    Realigned { from: u32, to: u32 },
}

#[derive(Debug, Clone)]
pub struct ClientReconciler {
    is_reconciling: bool,
    last_reconciled_frame: Option<u32>,
    thresholds: CorrectionThresholds,
    max_replay_frames: u32,
    corrections: u64,
    replayed_frames: u64,
    realignments: u64,
}

impl ClientReconciler {
    pub fn new(thresholds: CorrectionThresholds, max_replay_frames: u32) -> Self {
        Self {
            is_reconciling: false,
            last_reconciled_frame: None,
            thresholds,
            max_replay_frames,
            corrections: 0,
            replayed_frames: 0,
            realignments: 0,
        }
    }

    pub fn from_config(config: &SimulationConfig) -> Self {
        Self::new(config.thresholds, config.max_replay_frames)
    }

    pub fn is_reconciling(&self) -> bool {
        self.is_reconciling
    }

    pub fn last_reconciled_frame(&self) -> Option<u32> {
        self.last_reconciled_frame
    }

    pub fn corrections(&self) -> u64 {
        self.corrections
    }

    pub fn replayed_frames(&self) -> u64 {
        self.replayed_frames
    }

    pub fn realignments(&self) -> u64 {
        self.realignments
    }

    /// Forgets the last reconciled frame, for when frame numbering restarts.
    pub fn reset(&mut self) {
        self.last_reconciled_frame = None;
    }

    pub fn reconcile<W: PhysicsWorld>(
        &mut self,
        driver: &mut SimulationDriver<W>,
        authoritative: &SimulationSnapshot,
    ) -> Result<ReconcileOutcome> {
        if self.is_reconciling {
            debug!("Dropping snapshot {} received mid-replay", authoritative.frame);
            return Ok(ReconcileOutcome::Ignored(IgnoreReason::Reconciling));
        }

        let frame = authoritative.frame;
        if self.last_reconciled_frame.is_some_and(|last| frame <= last) {
            return Ok(ReconcileOutcome::Ignored(IgnoreReason::Duplicate));
        }

        let current = driver.frame();
        if frame > current {
            debug!(
                "Snapshot {} is ahead of local frame {}, applying directly",
                frame, current
            );
            return self.apply_directly(driver, authoritative, DirectReason::FutureFrame);
        }

        if current - frame > self.max_replay_frames {
            let stale = NetcodeError::StaleSnapshot {
                frame,
                current,
                limit: self.max_replay_frames,
            };
            debug!("{}, applying directly", stale);
            return self.apply_directly(driver, authoritative, DirectReason::Stale);
        }

        let Some(predicted) = driver.history().find(frame) else {
            debug!("No prediction recorded for frame {}, applying directly", frame);
            return self.apply_directly(driver, authoritative, DirectReason::HistoryMiss);
        };

        let diverged = predicted.diff(authoritative, &self.thresholds);
        if diverged.is_empty() {
            self.last_reconciled_frame = Some(frame);
            return Ok(ReconcileOutcome::InSync);
        }

        // Objects the server left out keep their predicted F-state.
        let mut start = predicted.clone();
        for truth in &authoritative.objects {
            match start
                .objects
                .binary_search_by_key(&truth.object_id, |state| state.object_id)
            {
                Ok(index) => start.objects[index] = *truth,
                Err(index) => start.objects.insert(index, *truth),
            }
        }

        self.is_reconciling = true;
        let replay = driver.resimulate_from(&start);
        self.is_reconciling = false;
        let replayed = replay?;

        self.last_reconciled_frame = Some(frame);
        self.corrections += 1;
        self.replayed_frames += replayed as u64;
        debug!(
            "Corrected frame {}: {} objects diverged, replayed {} frames",
            frame,
            diverged.len(),
            replayed
        );

        Ok(ReconcileOutcome::Corrected { replayed, diverged })
    }

    /// Puts the local frame counter back ahead of the server.
    ///
    /// The snapshot is applied at its own frame and the world is simulated
    /// forward to `target_frame` (never earlier than the snapshot), so later
    /// snapshots find recorded predictions to compare against. Local input
    /// buffers are cleared along with the old history.
    pub fn realign<W: PhysicsWorld>(
        &mut self,
        driver: &mut SimulationDriver<W>,
        authoritative: &SimulationSnapshot,
        target_frame: u32,
    ) -> Result<ReconcileOutcome> {
        if self.is_reconciling {
            return Ok(ReconcileOutcome::Ignored(IgnoreReason::Reconciling));
        }
        if self
            .last_reconciled_frame
            .is_some_and(|last| authoritative.frame <= last)
        {
            return Ok(ReconcileOutcome::Ignored(IgnoreReason::Duplicate));
        }

        let from = driver.frame();
        let to = target_frame.max(authoritative.frame);
        driver.reset_frame(to);

        self.is_reconciling = true;
        let replay = driver.resimulate_from(authoritative);
        self.is_reconciling = false;
        let replayed = replay?;

        self.last_reconciled_frame = Some(authoritative.frame);
        self.realignments += 1;
        self.replayed_frames += replayed as u64;
        debug!(
            "Realigned from frame {} to {} using snapshot {}",
            from, to, authoritative.frame
        );

        Ok(ReconcileOutcome::Realigned { from, to })
    }

    /// Reconciles a snapshot whose frame is only known as "`frames_back`
    /// frames before now", e.g. from the clock offset estimate.
    pub fn reconcile_elapsed<W: PhysicsWorld>(
        &mut self,
        driver: &mut SimulationDriver<W>,
        authoritative: &SimulationSnapshot,
        frames_back: u32,
    ) -> Result<ReconcileOutcome> {
        let relabeled = SimulationSnapshot {
            frame: driver.frame().saturating_sub(frames_back),
            objects: authoritative.objects.clone(),
        };
        self.reconcile(driver, &relabeled)
    }

    fn apply_directly<W: PhysicsWorld>(
        &mut self,
        driver: &mut SimulationDriver<W>,
        authoritative: &SimulationSnapshot,
        reason: DirectReason,
    ) -> Result<ReconcileOutcome> {
        driver.apply_snapshot(authoritative)?;
        self.last_reconciled_frame = Some(authoritative.frame);
        Ok(ReconcileOutcome::AppliedDirectly(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorKind;
    use crate::input::{Buttons, InputSample};
    use crate::physics::{BodyDesc, SimpleWorld};
    use glam::Vec3;

    fn controlled_driver(position: Vec3) -> SimulationDriver<SimpleWorld> {
        let mut driver = SimulationDriver::new(SimpleWorld::new(), SimulationConfig::default());
        driver.register_object(7, BodyDesc::at(position), ActorKind::roller()).unwrap();
        driver.control_object(7).unwrap();
        driver
    }

    fn run(driver: &mut SimulationDriver<SimpleWorld>, frames: u32) {
        for _ in 0..frames {
            let frame = driver.frame() + 1;
            let input = InputSample::new(frame, 7, Vec3::new(1.0, 0.0, 0.5), Buttons::NONE);
            driver.step_with(vec![input]).unwrap();
        }
    }

    fn reconciler() -> ClientReconciler {
        ClientReconciler::from_config(&SimulationConfig::default())
    }

    #[test]
    fn test_matching_snapshot_is_noop() {
        let mut driver = controlled_driver(Vec3::ZERO);
        run(&mut driver, 10);
        let before = driver.capture_snapshot().unwrap();
        let authoritative = driver.history().find(5).unwrap().clone();

        let outcome = reconciler().reconcile(&mut driver, &authoritative).unwrap();

        assert_eq!(outcome, ReconcileOutcome::InSync);
        assert_eq!(driver.capture_snapshot().unwrap(), before);
        assert_eq!(driver.frame(), 10);
    }

    #[test]
    fn test_divergence_rewinds_and_replays() {
        let mut client = controlled_driver(Vec3::new(0.0, 0.0, 5.0));
        client.reset_frame(100);
        client.record_current().unwrap();
        run(&mut client, 3);

        let mut reference = controlled_driver(Vec3::ZERO);
        reference.reset_frame(100);
        run(&mut reference, 3);

        let mut authoritative = client.history().find(100).unwrap().clone();
        authoritative.objects[0].transform.position = Vec3::ZERO;

        let mut reconciler = reconciler();
        let outcome = reconciler.reconcile(&mut client, &authoritative).unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Corrected {
                replayed: 3,
                diverged: vec![7]
            }
        );
        assert_eq!(client.frame(), 103);
        assert_eq!(client.object_state(7).unwrap(), reference.object_state(7).unwrap());
        assert_eq!(reconciler.last_reconciled_frame(), Some(100));
        assert_eq!(reconciler.corrections(), 1);
        assert!(!reconciler.is_reconciling());
    }

    #[test]
    fn test_duplicate_and_late_snapshots_ignored() {
        let mut driver = controlled_driver(Vec3::ZERO);
        run(&mut driver, 10);
        let mut reconciler = reconciler();

        let at_eight = driver.history().find(8).unwrap().clone();
        let at_six = driver.history().find(6).unwrap().clone();
        reconciler.reconcile(&mut driver, &at_eight).unwrap();

        assert_eq!(
            reconciler.reconcile(&mut driver, &at_eight).unwrap(),
            ReconcileOutcome::Ignored(IgnoreReason::Duplicate)
        );
        assert_eq!(
            reconciler.reconcile(&mut driver, &at_six).unwrap(),
            ReconcileOutcome::Ignored(IgnoreReason::Duplicate)
        );
    }

    #[test]
    fn test_snapshot_during_replay_is_dropped() {
        let mut driver = controlled_driver(Vec3::ZERO);
        run(&mut driver, 4);
        let snapshot = driver.history().find(2).unwrap().clone();
        let mut reconciler = reconciler();
        reconciler.is_reconciling = true;

        assert_eq!(
            reconciler.reconcile(&mut driver, &snapshot).unwrap(),
            ReconcileOutcome::Ignored(IgnoreReason::Reconciling)
        );
        assert_eq!(reconciler.last_reconciled_frame(), None);
    }

    #[test]
    fn test_evicted_frame_applied_directly() {
        let mut config = SimulationConfig::default();
        config.history_capacity = 4;
        let mut driver = SimulationDriver::new(SimpleWorld::new(), config);
        driver.register_object(7, BodyDesc::default(), ActorKind::roller()).unwrap();
        driver.control_object(7).unwrap();
        run(&mut driver, 10);

        let mut authoritative = driver.capture_snapshot().unwrap();
        authoritative.frame = 3;
        authoritative.objects[0].transform.position = Vec3::new(9.0, 9.0, 9.0);

        let outcome = reconciler().reconcile(&mut driver, &authoritative).unwrap();

        assert_eq!(outcome, ReconcileOutcome::AppliedDirectly(DirectReason::HistoryMiss));
        assert_eq!(driver.frame(), 10);
        assert_eq!(
            driver.object_state(7).unwrap().transform.position,
            Vec3::new(9.0, 9.0, 9.0)
        );
    }

    #[test]
    fn test_stale_snapshot_skips_replay() {
        let mut driver = controlled_driver(Vec3::ZERO);
        run(&mut driver, 30);
        let mut authoritative = driver.history().find(5).unwrap().clone();
        authoritative.objects[0].transform.position = Vec3::splat(2.0);

        let mut reconciler = ClientReconciler::new(CorrectionThresholds::default(), 10);
        let outcome = reconciler.reconcile(&mut driver, &authoritative).unwrap();

        assert_eq!(outcome, ReconcileOutcome::AppliedDirectly(DirectReason::Stale));
        assert_eq!(driver.frame(), 30);
        assert_eq!(reconciler.replayed_frames(), 0);
    }

    #[test]
    fn test_future_snapshot_keeps_frame_counter() {
        let mut driver = controlled_driver(Vec3::ZERO);
        run(&mut driver, 3);
        let mut authoritative = driver.capture_snapshot().unwrap();
        authoritative.frame = 50;
        authoritative.objects[0].transform.position = Vec3::Y;

        let outcome = reconciler().reconcile(&mut driver, &authoritative).unwrap();

        assert_eq!(outcome, ReconcileOutcome::AppliedDirectly(DirectReason::FutureFrame));
        assert_eq!(driver.frame(), 3);
        assert_eq!(driver.object_state(7).unwrap().transform.position, Vec3::Y);
    }

    #[test]
    fn test_realign_moves_frame_ahead_of_snapshot() {
        let mut server = controlled_driver(Vec3::ZERO);
        run(&mut server, 40);
        let authoritative = server.history().find(30).unwrap().clone();

        let mut client = controlled_driver(Vec3::ZERO);
        run(&mut client, 10);

        let mut reconciler = reconciler();
        let outcome = reconciler.realign(&mut client, &authoritative, 34).unwrap();

        assert_eq!(outcome, ReconcileOutcome::Realigned { from: 10, to: 34 });
        assert_eq!(client.frame(), 34);
        assert_eq!(
            client.history().find(30).unwrap().object(7).unwrap().transform,
            authoritative.object(7).unwrap().transform
        );
        assert!(client.history().find(10).is_none());
        assert_eq!(reconciler.realignments(), 1);
        assert_eq!(reconciler.last_reconciled_frame(), Some(30));

        // Later snapshots now land inside recorded history.
        let recorded = client.history().find(32).unwrap().clone();
        let outcome = reconciler.reconcile(&mut client, &recorded).unwrap();
        assert_eq!(outcome, ReconcileOutcome::InSync);

        let outcome = reconciler.realign(&mut client, &authoritative, 50).unwrap();
        assert_eq!(outcome, ReconcileOutcome::Ignored(IgnoreReason::Duplicate));
        assert_eq!(client.frame(), 34);
    }

    #[test]
    fn test_filtered_snapshot_keeps_other_objects_predicted() {
        let mut driver = controlled_driver(Vec3::ZERO);
        driver
            .register_object(8, BodyDesc::at(Vec3::new(0.0, 0.0, -10.0)), ActorKind::Passive)
            .unwrap();
        run(&mut driver, 10);
        let resting = driver.object_state(8).unwrap();

        let mut authoritative = driver.history().find(6).unwrap().moving_only(0.01);
        assert!(authoritative.object(8).is_none());
        authoritative.objects[0].linear_velocity += Vec3::new(0.0, 0.0, 3.0);

        let outcome = reconciler().reconcile(&mut driver, &authoritative).unwrap();

        assert!(matches!(outcome, ReconcileOutcome::Corrected { replayed: 4, .. }));
        assert_eq!(driver.object_state(8).unwrap(), resting);
    }

    #[test]
    fn test_reconcile_elapsed_relabels_frame() {
        let mut driver = controlled_driver(Vec3::ZERO);
        run(&mut driver, 12);
        let mut authoritative = driver.history().find(9).unwrap().clone();
        authoritative.frame = 0;

        let mut reconciler = reconciler();
        let outcome = reconciler
            .reconcile_elapsed(&mut driver, &authoritative, 3)
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::InSync);
        assert_eq!(reconciler.last_reconciled_frame(), Some(9));
    }
}
