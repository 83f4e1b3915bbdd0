//! How an input sample turns into forces on a body.
//!
//! Each registered object carries an [`ActorKind`]. The driver calls
//! [`ActorKind::apply`] once per frame with that frame's input, before the
//! physics step.

use crate::error::Result;
use crate::input::{Buttons, InputSample};
use crate::physics::{BodyDesc, BodyHandle, PhysicsWorld};
use crate::ObjectId;
use glam::Vec3;

const GOLDEN_ANGLE: f32 = 2.399_963;

/// Game-specific input mapping registered from outside the crate.
pub type ApplyInputFn = fn(&mut dyn PhysicsWorld, BodyHandle, &InputSample) -> Result<()>;

#[derive(Debug, Clone, Copy)]
pub enum ActorKind {
    /// Physics-only object; inputs are ignored.
    Passive,
    /// Ball pawn rolled by planar movement, hops on ABILITY.
    Roller { roll_force: f32, jump_impulse: f32 },
    /// Ship pawn thrusting along its own axes. BOOST scales thrust, CROUCH
    /// brakes against current velocity.
    Thruster {
        thrust: f32,
        boost_multiplier: f32,
        brake: f32,
    },
    Custom(ApplyInputFn),
}

impl ActorKind {
    pub fn roller() -> Self {
        ActorKind::Roller {
            roll_force: 20.0,
            jump_impulse: 5.0,
        }
    }

    pub fn thruster() -> Self {
        ActorKind::Thruster {
            thrust: 15.0,
            boost_multiplier: 2.0,
            brake: 4.0,
        }
    }

    pub fn accepts_input(&self) -> bool {
        !matches!(self, ActorKind::Passive)
    }

    pub fn apply(
        &self,
        world: &mut dyn PhysicsWorld,
        handle: BodyHandle,
        input: &InputSample,
    ) -> Result<()> {
        match *self {
            ActorKind::Passive => Ok(()),
            ActorKind::Roller {
                roll_force,
                jump_impulse,
            } => {
                let planar = Vec3::new(input.movement.x, 0.0, input.movement.z).clamp_length_max(1.0);
                if planar != Vec3::ZERO {
                    world.apply_central_force(handle, planar * roll_force)?;
                }
                if input.buttons.contains(Buttons::ABILITY) {
                    let center = world.transform(handle)?.position;
                    world.apply_impulse(handle, Vec3::Y * jump_impulse, center)?;
                }
                Ok(())
            }
            ActorKind::Thruster {
                thrust,
                boost_multiplier,
                brake,
            } => {
                let rotation = world.transform(handle)?.rotation;
                let mut scale = thrust;
                if input.buttons.contains(Buttons::BOOST) {
                    scale *= boost_multiplier;
                }
                let direction = input.movement.clamp_length_max(1.0);
                if direction != Vec3::ZERO {
                    world.apply_central_force(handle, rotation * direction * scale)?;
                }
                if input.buttons.contains(Buttons::CROUCH) {
                    let velocity = world.linear_velocity(handle)?;
                    world.apply_central_force(handle, -velocity * brake)?;
                }
                Ok(())
            }
            ActorKind::Custom(apply) => apply(world, handle, input),
        }
    }
}

impl Default for ActorKind {
    fn default() -> Self {
        ActorKind::Passive
    }
}

/// Spawn point for a player-controlled object. Deterministic so both peers
/// create the body in the same place.
pub fn spawn_position(object_id: ObjectId) -> Vec3 {
    let angle = object_id as f32 * GOLDEN_ANGLE;
    let radius = 2.0 + (object_id % 16) as f32 * 0.75;
    Vec3::new(angle.cos() * radius, 0.5, angle.sin() * radius)
}

/// Body used for every player pawn.
pub fn actor_body(object_id: ObjectId) -> BodyDesc {
    BodyDesc {
        linear_damping: 0.5,
        angular_damping: 0.5,
        restitution: 0.2,
        ..BodyDesc::at(spawn_position(object_id))
    }
}
