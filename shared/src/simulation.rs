//! Fixed-timestep simulation driver.
//!
//! Wall-clock deltas go into an accumulator which is drained in whole steps
//! of `fixed_dt`. Each step applies the inputs for the frame being produced,
//! steps the physics world, advances the frame counter by exactly one and
//! records the resulting snapshot. The same step is used for normal play and
//! for replay after a correction, which is what makes replay reproduce the
//! original prediction when nothing but the starting state differs.

use crate::actor::ActorKind;
use crate::config::SimulationConfig;
use crate::error::{NetcodeError, Result};
use crate::input::{InputBuffer, InputSample};
use crate::physics::{BodyDesc, BodyHandle, PhysicsWorld};
use crate::state::{ObjectState, SimulationSnapshot, StateHistory};
use crate::ObjectId;
use log::{debug, warn};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy)]
struct Registered {
    handle: BodyHandle,
    kind: ActorKind,
}

pub struct SimulationDriver<W: PhysicsWorld> {
    world: W,
    config: SimulationConfig,
    /// Last completed frame; the next step produces `frame + 1`.
    frame: u32,
    accumulator: f64,
    objects: BTreeMap<ObjectId, Registered>,
    /// Inputs for objects this peer controls, kept for replay.
    local_inputs: BTreeMap<ObjectId, InputBuffer>,
    history: StateHistory,
}

impl<W: PhysicsWorld> SimulationDriver<W> {
    pub fn new(world: W, config: SimulationConfig) -> Self {
        let history = StateHistory::new(config.history_capacity);
        Self {
            world,
            config,
            frame: 0,
            accumulator: 0.0,
            objects: BTreeMap::new(),
            local_inputs: BTreeMap::new(),
            history,
        }
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn world(&self) -> &W {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut W {
        &mut self.world
    }

    pub fn history(&self) -> &StateHistory {
        &self.history
    }

    /// Fraction of a step left in the accumulator, for render interpolation.
    pub fn alpha(&self) -> f32 {
        (self.accumulator / self.config.fixed_dt as f64) as f32
    }

    /// Restarts frame numbering at `frame`. History, the accumulator and
    /// local inputs refer to the old numbering and are discarded.
    pub fn reset_frame(&mut self, frame: u32) {
        self.frame = frame;
        self.accumulator = 0.0;
        self.history.clear();
        for buffer in self.local_inputs.values_mut() {
            buffer.clear();
        }
    }

    /// Creates a body for `object_id`, replacing any existing one.
    pub fn register_object(
        &mut self,
        object_id: ObjectId,
        desc: BodyDesc,
        kind: ActorKind,
    ) -> Result<BodyHandle> {
        if let Some(previous) = self.objects.remove(&object_id) {
            self.world.remove_body(previous.handle)?;
        }
        let handle = self.world.add_body(desc);
        self.objects.insert(object_id, Registered { handle, kind });
        debug!("Registered object {} as {:?}", object_id, handle);
        Ok(handle)
    }

    pub fn remove_object(&mut self, object_id: ObjectId) -> Result<()> {
        let registered = self
            .objects
            .remove(&object_id)
            .ok_or(NetcodeError::InvalidObjectId(object_id))?;
        self.local_inputs.remove(&object_id);
        self.world.remove_body(registered.handle)
    }

    pub fn contains_object(&self, object_id: ObjectId) -> bool {
        self.objects.contains_key(&object_id)
    }

    pub fn handle(&self, object_id: ObjectId) -> Option<BodyHandle> {
        self.objects.get(&object_id).map(|registered| registered.handle)
    }

    pub fn object_ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.objects.keys().copied()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Marks an object as driven by this peer: its inputs are buffered here
    /// and replayed after corrections.
    pub fn control_object(&mut self, object_id: ObjectId) -> Result<()> {
        if !self.objects.contains_key(&object_id) {
            return Err(NetcodeError::InvalidObjectId(object_id));
        }
        let capacity = self.config.input_capacity;
        self.local_inputs
            .entry(object_id)
            .or_insert_with(|| InputBuffer::new(capacity));
        Ok(())
    }

    pub fn release_control(&mut self, object_id: ObjectId) {
        self.local_inputs.remove(&object_id);
    }

    pub fn is_controlled(&self, object_id: ObjectId) -> bool {
        self.local_inputs.contains_key(&object_id)
    }

    pub fn local_inputs(&self, object_id: ObjectId) -> Option<&InputBuffer> {
        self.local_inputs.get(&object_id)
    }

    pub fn push_local_input(&mut self, sample: InputSample) -> Result<()> {
        let buffer = self
            .local_inputs
            .get_mut(&sample.object_id)
            .ok_or(NetcodeError::InvalidObjectId(sample.object_id))?;
        buffer.push(sample);
        Ok(())
    }

    /// How many steps [`SimulationDriver::tick_with`] would run for
    /// `wall_dt`, capped at `max_steps_per_tick`. Lets a caller gather the
    /// inputs for a whole tick before stepping.
    pub fn pending_steps(&self, wall_dt: f64) -> u32 {
        let dt = self.config.fixed_dt as f64;
        let mut accumulator = self.accumulator + wall_dt.max(0.0);

        let mut due = 0;
        while accumulator >= dt && due < self.config.max_steps_per_tick {
            accumulator -= dt;
            due += 1;
        }
        due
    }

    /// Advances by whole fixed steps using only already buffered inputs.
    pub fn tick(&mut self, wall_dt: f64) -> Result<u32> {
        self.tick_with(wall_dt, |_| Vec::new())
    }

    /// Advances by whole fixed steps. `inputs_for` is called with the frame
    /// about to be produced; samples for controlled objects are buffered for
    /// replay, the rest are applied for that step only.
    ///
    /// Returns the number of steps run. If the backlog needs more than
    /// `max_steps_per_tick` steps the remainder is dropped in whole steps
    /// and reported as [`NetcodeError::SimulationStall`].
    pub fn tick_with<F>(&mut self, wall_dt: f64, mut inputs_for: F) -> Result<u32>
    where
        F: FnMut(u32) -> Vec<InputSample>,
    {
        let dt = self.config.fixed_dt as f64;
        self.accumulator += wall_dt.max(0.0);

        let mut executed = 0;
        while self.accumulator >= dt {
            if executed >= self.config.max_steps_per_tick {
                let dropped = (self.accumulator / dt).floor();
                self.accumulator -= dropped * dt;
                warn!(
                    "Simulation stalled at frame {}: ran {} steps, dropping {} more",
                    self.frame, executed, dropped
                );
                return Err(NetcodeError::SimulationStall {
                    executed,
                    dropped: dropped as u32,
                });
            }

            let inputs = inputs_for(self.frame + 1);
            self.step_with(inputs)?;
            self.accumulator -= dt;
            executed += 1;
        }

        Ok(executed)
    }

    /// Runs exactly one fixed step and returns the new frame number.
    pub fn step_with(&mut self, inputs: Vec<InputSample>) -> Result<u32> {
        let mut external = Vec::new();
        for sample in inputs {
            match self.local_inputs.get_mut(&sample.object_id) {
                Some(buffer) => {
                    buffer.push(sample);
                }
                None => external.push(sample),
            }
        }

        self.advance_frame(&external)
    }

    fn advance_frame(&mut self, external: &[InputSample]) -> Result<u32> {
        let next = self.frame + 1;
        self.apply_inputs(next, external)?;
        self.world.step(self.config.fixed_dt, self.config.substeps);
        self.frame = next;

        let snapshot = self.capture_snapshot()?;
        self.history.record(snapshot);
        Ok(next)
    }

    fn apply_inputs(&mut self, frame: u32, external: &[InputSample]) -> Result<()> {
        for (object_id, buffer) in &self.local_inputs {
            let (Some(sample), Some(registered)) =
                (buffer.by_frame(frame), self.objects.get(object_id))
            else {
                continue;
            };
            registered.kind.apply(&mut self.world, registered.handle, sample)?;
        }

        for sample in external {
            match self.objects.get(&sample.object_id) {
                Some(registered) => {
                    registered.kind.apply(&mut self.world, registered.handle, sample)?;
                }
                None => warn!(
                    "Skipping input for unknown object {} at frame {}",
                    sample.object_id, frame
                ),
            }
        }

        Ok(())
    }

    pub fn object_state(&self, object_id: ObjectId) -> Result<ObjectState> {
        let registered = self
            .objects
            .get(&object_id)
            .ok_or(NetcodeError::InvalidObjectId(object_id))?;
        read_state(&self.world, object_id, registered.handle)
    }

    /// Reads every registered body at the current frame.
    pub fn capture_snapshot(&self) -> Result<SimulationSnapshot> {
        let objects = self
            .objects
            .iter()
            .map(|(object_id, registered)| read_state(&self.world, *object_id, registered.handle))
            .collect::<Result<Vec<_>>>()?;

        Ok(SimulationSnapshot {
            frame: self.frame,
            objects,
        })
    }

    /// Records the current state as this frame's snapshot, e.g. after
    /// spawning bodies before the first step.
    pub fn record_current(&mut self) -> Result<()> {
        let snapshot = self.capture_snapshot()?;
        self.history.record(snapshot);
        Ok(())
    }

    /// Overwrites body state with `snapshot` without touching the frame
    /// counter. Unknown object ids are skipped. Returns how many objects were
    /// applied.
    pub fn apply_snapshot(&mut self, snapshot: &SimulationSnapshot) -> Result<usize> {
        let mut applied = 0;
        for state in &snapshot.objects {
            let Some(registered) = self.objects.get(&state.object_id) else {
                warn!(
                    "Snapshot for frame {} references unknown object {}",
                    snapshot.frame, state.object_id
                );
                continue;
            };
            let handle = registered.handle;
            self.world.set_transform(handle, state.transform)?;
            self.world.set_linear_velocity(handle, state.linear_velocity)?;
            self.world.set_angular_velocity(handle, state.angular_velocity)?;
            self.world.clear_forces(handle)?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Rewinds to `snapshot.frame`, applies the snapshot, and replays buffered
    /// local inputs up to the frame that was current before the call. Every
    /// replayed frame overwrites its history entry. Returns frames replayed.
    pub fn resimulate_from(&mut self, snapshot: &SimulationSnapshot) -> Result<u32> {
        let target = self.frame.max(snapshot.frame);

        self.apply_snapshot(snapshot)?;
        self.frame = snapshot.frame;
        self.record_current()?;

        while self.frame < target {
            self.advance_frame(&[])?;
        }

        Ok(target - snapshot.frame)
    }
}

fn read_state<W: PhysicsWorld>(world: &W, object_id: ObjectId, handle: BodyHandle) -> Result<ObjectState> {
    Ok(ObjectState {
        object_id,
        transform: world.transform(handle)?,
        linear_velocity: world.linear_velocity(handle)?,
        angular_velocity: world.angular_velocity(handle)?,
        force: world.force(handle)?,
    })
}
