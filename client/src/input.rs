//! Client input sampling with frame stamping and change detection
//!
//! Device polling is the host's business; anything implementing
//! [`InputSource`] can drive the local pawn. The binary uses [`BotInput`], a
//! seeded random walker, so runs are reproducible without a window.

use glam::Vec3;
use log::trace;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::input::{Buttons, InputSample};
use shared::ObjectId;
use std::f32::consts::TAU;

/// What the controlling device reports for one frame
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RawInput {
    pub movement: Vec3,
    pub buttons: Buttons,
}

pub trait InputSource {
    fn poll(&mut self) -> RawInput;
}

impl<F: FnMut() -> RawInput> InputSource for F {
    fn poll(&mut self) -> RawInput {
        self()
    }
}

/// Scripted player: holds a random heading for a random number of frames,
/// sometimes boosting, and hops now and then.
pub struct BotInput {
    rng: StdRng,
    current: RawInput,
    hold_frames: u32,
}

impl BotInput {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            current: RawInput::default(),
            hold_frames: 0,
        }
    }

    fn choose_next(&mut self) {
        let movement = if self.rng.gen_bool(0.25) {
            Vec3::ZERO
        } else {
            let heading = self.rng.gen_range(0.0..TAU);
            Vec3::new(heading.cos(), 0.0, heading.sin())
        };

        let mut buttons = Buttons::NONE;
        if self.rng.gen_bool(0.1) {
            buttons.insert(Buttons::BOOST);
        }

        self.current = RawInput { movement, buttons };
        self.hold_frames = self.rng.gen_range(10..90);
    }
}

impl InputSource for BotInput {
    fn poll(&mut self) -> RawInput {
        if self.hold_frames == 0 {
            self.choose_next();
        }
        self.hold_frames -= 1;

        let mut raw = self.current;
        if self.rng.gen_bool(0.02) {
            raw.buttons.insert(Buttons::ABILITY);
        }
        raw
    }
}

/// Turns raw device state into frame-stamped samples for one pawn
pub struct InputManager {
    previous: RawInput,
    changes: u64,
    samples: u64,
}

impl InputManager {
    pub fn new() -> Self {
        Self {
            previous: RawInput::default(),
            changes: 0,
            samples: 0,
        }
    }

    pub fn sample(
        &mut self,
        source: &mut dyn InputSource,
        frame: u32,
        object_id: ObjectId,
    ) -> InputSample {
        let raw = source.poll();
        if raw != self.previous {
            trace!("Input changed at frame {}: {:?}", frame, raw);
            self.changes += 1;
            self.previous = raw;
        }
        self.samples += 1;

        InputSample::new(frame, object_id, raw.movement, raw.buttons)
    }

    /// Number of samples whose raw state differed from the one before
    pub fn changes(&self) -> u64 {
        self.changes
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }
}

impl Default for InputManager {
    fn default() -> Self {
        Self::new()
    }
}
