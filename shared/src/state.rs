//! Object states, whole-world snapshots and the per-frame history.

use crate::error::Result;
use crate::physics::Transform;
use crate::ring_buffer::RingBuffer;
use crate::ObjectId;
use glam::Vec3;
use serde::{Deserialize, Serialize};

/// One body's state after a physics step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObjectState {
    pub object_id: ObjectId,
    pub transform: Transform,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
    pub force: Vec3,
}

impl ObjectState {
    pub fn at_rest(object_id: ObjectId, transform: Transform) -> Self {
        Self {
            object_id,
            transform,
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            force: Vec3::ZERO,
        }
    }

    pub fn speed(&self) -> f32 {
        self.linear_velocity
            .length()
            .max(self.angular_velocity.length())
    }
}

/// Tolerances beyond which a prediction is considered wrong.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorrectionThresholds {
    pub position: f32,
    /// Radians.
    pub rotation: f32,
    pub linear_velocity: f32,
    pub angular_velocity: f32,
}

impl Default for CorrectionThresholds {
    fn default() -> Self {
        Self {
            position: 0.05,
            rotation: 0.05,
            linear_velocity: 0.5,
            angular_velocity: 0.5,
        }
    }
}

impl CorrectionThresholds {
    /// True when any component of `predicted` is further from
    /// `authoritative` than its tolerance.
    pub fn requires_correction(&self, predicted: &ObjectState, authoritative: &ObjectState) -> bool {
        let position_error = predicted
            .transform
            .position
            .distance(authoritative.transform.position);
        let rotation_error = predicted
            .transform
            .rotation
            .angle_between(authoritative.transform.rotation);
        let linear_error = predicted
            .linear_velocity
            .distance(authoritative.linear_velocity);
        let angular_error = predicted
            .angular_velocity
            .distance(authoritative.angular_velocity);

        position_error > self.position
            || rotation_error > self.rotation
            || linear_error > self.linear_velocity
            || angular_error > self.angular_velocity
    }
}

/// Every simulated object's state at one frame, sorted by object id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationSnapshot {
    pub frame: u32,
    pub objects: Vec<ObjectState>,
}

impl SimulationSnapshot {
    pub fn new(frame: u32, mut objects: Vec<ObjectState>) -> Self {
        objects.sort_by_key(|state| state.object_id);
        objects.dedup_by_key(|state| state.object_id);
        Self { frame, objects }
    }

    pub fn object(&self, object_id: ObjectId) -> Option<&ObjectState> {
        self.objects
            .binary_search_by_key(&object_id, |state| state.object_id)
            .ok()
            .map(|index| &self.objects[index])
    }

    /// Ids of objects in `authoritative` whose state here exceeds the
    /// thresholds. An object this snapshot does not have counts as
    /// diverged; objects only present here are not compared.
    pub fn diff(&self, authoritative: &SimulationSnapshot, thresholds: &CorrectionThresholds) -> Vec<ObjectId> {
        authoritative
            .objects
            .iter()
            .filter(|truth| match self.object(truth.object_id) {
                Some(predicted) => thresholds.requires_correction(predicted, truth),
                None => true,
            })
            .map(|truth| truth.object_id)
            .collect()
    }

    /// Drops objects slower than `min_speed` in both linear and angular
    /// velocity.
    pub fn moving_only(&self, min_speed: f32) -> SimulationSnapshot {
        SimulationSnapshot {
            frame: self.frame,
            objects: self
                .objects
                .iter()
                .filter(|state| state.speed() >= min_speed)
                .copied()
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Result of [`StateHistory::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Appended,
    Overwritten,
    /// Older than the retained window and not present; discarded.
    Rejected,
}

/// The last N snapshots, ordered by frame.
#[derive(Debug, Clone)]
pub struct StateHistory {
    snapshots: RingBuffer<SimulationSnapshot>,
}

impl StateHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            snapshots: RingBuffer::new(capacity),
        }
    }

    /// Appends a snapshot newer than anything stored, or overwrites the
    /// stored snapshot for the same frame during replay.
    pub fn record(&mut self, snapshot: SimulationSnapshot) -> RecordOutcome {
        match self.snapshots.newest() {
            Ok(newest) if newest.frame >= snapshot.frame => {}
            _ => {
                self.snapshots.push(snapshot);
                return RecordOutcome::Appended;
            }
        }

        match self
            .snapshots
            .iter_mut()
            .find(|stored| stored.frame == snapshot.frame)
        {
            Some(stored) => {
                *stored = snapshot;
                RecordOutcome::Overwritten
            }
            None => RecordOutcome::Rejected,
        }
    }

    pub fn find(&self, frame: u32) -> Option<&SimulationSnapshot> {
        let newest = self.snapshots.newest().ok()?;
        let age = newest.frame.checked_sub(frame)? as usize;
        // Frames are contiguous in normal use, so the age lookup is exact.
        match self.snapshots.get(age) {
            Ok(snapshot) if snapshot.frame == frame => Some(snapshot),
            _ => self
                .snapshots
                .iter()
                .rev()
                .find(|snapshot| snapshot.frame == frame),
        }
    }

    pub fn get(&self, age: usize) -> Result<&SimulationSnapshot> {
        self.snapshots.get(age)
    }

    pub fn newest(&self) -> Result<&SimulationSnapshot> {
        self.snapshots.newest()
    }

    pub fn oldest_frame(&self) -> Option<u32> {
        self.snapshots.oldest().ok().map(|snapshot| snapshot.frame)
    }

    pub fn frames(&self) -> impl Iterator<Item = u32> + '_ {
        self.snapshots.iter().map(|snapshot| snapshot.frame)
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.snapshots.capacity()
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
    }
}
