//! Physics engine boundary.
//!
//! The netcode core only talks to a rigid-body engine through
//! [`PhysicsWorld`]: step the world, read and write per-body transforms and
//! velocities, and push forces. Bodies are addressed by [`BodyHandle`], a
//! generational arena index, so a handle kept after its body was removed is
//! detected instead of silently aliasing a new body.
//!
//! [`SimpleWorld`] is the reference engine used by both binaries and the
//! tests. It integrates spheres with semi-implicit Euler in a fixed order,
//! which makes it bit-for-bit deterministic for identical state and inputs.

use crate::error::{NetcodeError, Result};
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Position plus orientation of a rigid body.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Transform {
    pub const IDENTITY: Transform = Transform {
        position: Vec3::ZERO,
        rotation: Quat::IDENTITY,
    };

    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
        }
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Stable handle to a body slot. The generation changes every time the slot
/// is freed, invalidating outstanding handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BodyHandle {
    pub index: u32,
    pub generation: u32,
}

/// Construction parameters for a dynamic sphere body.
#[derive(Debug, Clone, Copy)]
pub struct BodyDesc {
    pub transform: Transform,
    pub mass: f32,
    pub radius: f32,
    pub linear_damping: f32,
    pub angular_damping: f32,
    pub restitution: f32,
}

impl Default for BodyDesc {
    fn default() -> Self {
        Self {
            transform: Transform::IDENTITY,
            mass: 1.0,
            radius: 0.5,
            linear_damping: 0.0,
            angular_damping: 0.0,
            restitution: 0.3,
        }
    }
}

impl BodyDesc {
    pub fn at(position: Vec3) -> Self {
        Self {
            transform: Transform::from_position(position),
            ..Default::default()
        }
    }
}

/// The engine operations the simulation driver and reconciler rely on.
///
/// Implementations must be deterministic: the same body states, the same
/// applied forces and the same `step` arguments must produce the same result.
pub trait PhysicsWorld {
    fn add_body(&mut self, desc: BodyDesc) -> BodyHandle;
    fn remove_body(&mut self, handle: BodyHandle) -> Result<()>;
    fn contains(&self, handle: BodyHandle) -> bool;

    /// Advances the world by `dt` seconds split into `substeps` equal steps.
    /// Accumulated forces are cleared afterwards.
    fn step(&mut self, dt: f32, substeps: u32);

    fn transform(&self, handle: BodyHandle) -> Result<Transform>;
    fn set_transform(&mut self, handle: BodyHandle, transform: Transform) -> Result<()>;
    fn linear_velocity(&self, handle: BodyHandle) -> Result<Vec3>;
    fn set_linear_velocity(&mut self, handle: BodyHandle, velocity: Vec3) -> Result<()>;
    fn angular_velocity(&self, handle: BodyHandle) -> Result<Vec3>;
    fn set_angular_velocity(&mut self, handle: BodyHandle, velocity: Vec3) -> Result<()>;

    /// Force accumulated since the last step.
    fn force(&self, handle: BodyHandle) -> Result<Vec3>;
    fn clear_forces(&mut self, handle: BodyHandle) -> Result<()>;

    fn apply_central_force(&mut self, handle: BodyHandle, force: Vec3) -> Result<()>;
    /// Applies `force` at a world-space `point`, producing torque about the
    /// body's center.
    fn apply_force(&mut self, handle: BodyHandle, force: Vec3, point: Vec3) -> Result<()>;
    fn apply_impulse(&mut self, handle: BodyHandle, impulse: Vec3, point: Vec3) -> Result<()>;
    fn apply_torque(&mut self, handle: BodyHandle, torque: Vec3) -> Result<()>;
    fn apply_torque_impulse(&mut self, handle: BodyHandle, torque: Vec3) -> Result<()>;
}

#[derive(Debug, Clone)]
struct RigidBody {
    transform: Transform,
    linear_velocity: Vec3,
    angular_velocity: Vec3,
    force: Vec3,
    torque: Vec3,
    inverse_mass: f32,
    /// Solid sphere: I = 2/5 m r^2
    inverse_inertia: f32,
    radius: f32,
    linear_damping: f32,
    angular_damping: f32,
    restitution: f32,
}

impl RigidBody {
    fn new(desc: BodyDesc) -> Self {
        let mass = desc.mass.max(f32::EPSILON);
        let radius = desc.radius.max(f32::EPSILON);
        let inertia = 0.4 * mass * radius * radius;
        Self {
            transform: desc.transform,
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            force: Vec3::ZERO,
            torque: Vec3::ZERO,
            inverse_mass: 1.0 / mass,
            inverse_inertia: 1.0 / inertia,
            radius,
            linear_damping: desc.linear_damping,
            angular_damping: desc.angular_damping,
            restitution: desc.restitution,
        }
    }

    fn integrate(&mut self, dt: f32, gravity: Vec3) {
        let acceleration = self.force * self.inverse_mass + gravity;
        self.linear_velocity += acceleration * dt;
        self.linear_velocity /= 1.0 + self.linear_damping * dt;
        self.transform.position += self.linear_velocity * dt;

        self.angular_velocity += self.torque * self.inverse_inertia * dt;
        self.angular_velocity /= 1.0 + self.angular_damping * dt;
        let spin = Quat::from_scaled_axis(self.angular_velocity * dt);
        self.transform.rotation = (spin * self.transform.rotation).normalize();
    }

    fn resolve_ground(&mut self, ground_height: f32) {
        let bottom = self.transform.position.y - self.radius;
        if bottom < ground_height {
            self.transform.position.y = ground_height + self.radius;
            if self.linear_velocity.y < 0.0 {
                self.linear_velocity.y = -self.linear_velocity.y * self.restitution;
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    body: Option<RigidBody>,
}

/// Deterministic sphere world with gravity, an optional ground plane and
/// pairwise sphere contacts.
#[derive(Debug, Clone)]
pub struct SimpleWorld {
    slots: Vec<Slot>,
    free: Vec<u32>,
    gravity: Vec3,
    ground_height: Option<f32>,
}

impl SimpleWorld {
    /// Zero gravity, no ground. Matches the space-flight setup where bodies
    /// only move under applied forces.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            gravity: Vec3::ZERO,
            ground_height: None,
        }
    }

    /// Earth gravity over a ground plane at y = 0. Both binaries run this.
    pub fn arena() -> Self {
        Self::new()
            .with_gravity(Vec3::new(0.0, -9.81, 0.0))
            .with_ground(0.0)
    }

    pub fn with_gravity(mut self, gravity: Vec3) -> Self {
        self.gravity = gravity;
        self
    }

    pub fn with_ground(mut self, height: f32) -> Self {
        self.ground_height = Some(height);
        self
    }

    pub fn body_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.body.is_some()).count()
    }

    /// Live handles in slot order.
    pub fn handles(&self) -> Vec<BodyHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.body.is_some())
            .map(|(index, slot)| BodyHandle {
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }

    fn body(&self, handle: BodyHandle) -> Result<&RigidBody> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.body.as_ref())
            .ok_or(NetcodeError::StaleBodyHandle(handle))
    }

    fn body_mut(&mut self, handle: BodyHandle) -> Result<&mut RigidBody> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.body.as_mut())
            .ok_or(NetcodeError::StaleBodyHandle(handle))
    }

    fn resolve_contacts(&mut self) {
        let live: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.body.is_some())
            .map(|(index, _)| index)
            .collect();

        for i in 0..live.len() {
            for j in (i + 1)..live.len() {
                let (head, tail) = self.slots.split_at_mut(live[j]);
                if let (Some(first), Some(second)) =
                    (head[live[i]].body.as_mut(), tail[0].body.as_mut())
                {
                    resolve_sphere_contact(first, second);
                }
            }
        }
    }
}

impl Default for SimpleWorld {
    fn default() -> Self {
        Self::new()
    }
}

/// Pushes two overlapping spheres apart along the contact normal and
/// exchanges the normal component of their velocities, damped by the lower
/// restitution of the pair.
fn resolve_sphere_contact(first: &mut RigidBody, second: &mut RigidBody) {
    let delta = second.transform.position - first.transform.position;
    let distance = delta.length();
    let min_distance = first.radius + second.radius;

    if distance >= min_distance {
        return;
    }

    let normal = if distance < 1e-6 {
        Vec3::X
    } else {
        delta / distance
    };

    let total_inverse_mass = first.inverse_mass + second.inverse_mass;
    let overlap = min_distance - distance;
    first.transform.position -= normal * overlap * (first.inverse_mass / total_inverse_mass);
    second.transform.position += normal * overlap * (second.inverse_mass / total_inverse_mass);

    let closing = (second.linear_velocity - first.linear_velocity).dot(normal);
    if closing < 0.0 {
        let restitution = first.restitution.min(second.restitution);
        let impulse = -(1.0 + restitution) * closing / total_inverse_mass;
        first.linear_velocity -= normal * impulse * first.inverse_mass;
        second.linear_velocity += normal * impulse * second.inverse_mass;
    }
}

impl PhysicsWorld for SimpleWorld {
    fn add_body(&mut self, desc: BodyDesc) -> BodyHandle {
        let body = RigidBody::new(desc);
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.body = Some(body);
            BodyHandle {
                index,
                generation: slot.generation,
            }
        } else {
            self.slots.push(Slot {
                generation: 0,
                body: Some(body),
            });
            BodyHandle {
                index: (self.slots.len() - 1) as u32,
                generation: 0,
            }
        }
    }

    fn remove_body(&mut self, handle: BodyHandle) -> Result<()> {
        self.body(handle)?;
        let slot = &mut self.slots[handle.index as usize];
        slot.body = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Ok(())
    }

    fn contains(&self, handle: BodyHandle) -> bool {
        self.body(handle).is_ok()
    }

    fn step(&mut self, dt: f32, substeps: u32) {
        let substeps = substeps.max(1);
        let sub_dt = dt / substeps as f32;
        let gravity = self.gravity;
        let ground = self.ground_height;

        for _ in 0..substeps {
            for body in self.slots.iter_mut().filter_map(|slot| slot.body.as_mut()) {
                body.integrate(sub_dt, gravity);
                if let Some(height) = ground {
                    body.resolve_ground(height);
                }
            }
            self.resolve_contacts();
        }

        for body in self.slots.iter_mut().filter_map(|slot| slot.body.as_mut()) {
            body.force = Vec3::ZERO;
            body.torque = Vec3::ZERO;
        }
    }

    fn transform(&self, handle: BodyHandle) -> Result<Transform> {
        Ok(self.body(handle)?.transform)
    }

    fn set_transform(&mut self, handle: BodyHandle, transform: Transform) -> Result<()> {
        self.body_mut(handle)?.transform = transform;
        Ok(())
    }

    fn linear_velocity(&self, handle: BodyHandle) -> Result<Vec3> {
        Ok(self.body(handle)?.linear_velocity)
    }

    fn set_linear_velocity(&mut self, handle: BodyHandle, velocity: Vec3) -> Result<()> {
        self.body_mut(handle)?.linear_velocity = velocity;
        Ok(())
    }

    fn angular_velocity(&self, handle: BodyHandle) -> Result<Vec3> {
        Ok(self.body(handle)?.angular_velocity)
    }

    fn set_angular_velocity(&mut self, handle: BodyHandle, velocity: Vec3) -> Result<()> {
        self.body_mut(handle)?.angular_velocity = velocity;
        Ok(())
    }

    fn force(&self, handle: BodyHandle) -> Result<Vec3> {
        Ok(self.body(handle)?.force)
    }

    fn clear_forces(&mut self, handle: BodyHandle) -> Result<()> {
        let body = self.body_mut(handle)?;
        body.force = Vec3::ZERO;
        body.torque = Vec3::ZERO;
        Ok(())
    }

    fn apply_central_force(&mut self, handle: BodyHandle, force: Vec3) -> Result<()> {
        self.body_mut(handle)?.force += force;
        Ok(())
    }

    fn apply_force(&mut self, handle: BodyHandle, force: Vec3, point: Vec3) -> Result<()> {
        let body = self.body_mut(handle)?;
        let arm = point - body.transform.position;
        body.force += force;
        body.torque += arm.cross(force);
        Ok(())
    }

    fn apply_impulse(&mut self, handle: BodyHandle, impulse: Vec3, point: Vec3) -> Result<()> {
        let body = self.body_mut(handle)?;
        let arm = point - body.transform.position;
        body.linear_velocity += impulse * body.inverse_mass;
        body.angular_velocity += arm.cross(impulse) * body.inverse_inertia;
        Ok(())
    }

    fn apply_torque(&mut self, handle: BodyHandle, torque: Vec3) -> Result<()> {
        self.body_mut(handle)?.torque += torque;
        Ok(())
    }

    fn apply_torque_impulse(&mut self, handle: BodyHandle, torque: Vec3) -> Result<()> {
        let body = self.body_mut(handle)?;
        body.angular_velocity += torque * body.inverse_inertia;
        Ok(())
    }
}
