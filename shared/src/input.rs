//! Input samples and the per-actor input buffer.
//!
//! Clients produce one [`InputSample`] per fixed step for the actor they
//! control. Outgoing packets carry the last few samples rather than just the
//! newest one, so a lost datagram rarely loses a frame of input; receivers
//! collapse the resulting duplicates by frame number. Runs of identical
//! consecutive samples are run-length encoded on the wire with
//! [`compress_inputs`].

use crate::error::Result;
use crate::ring_buffer::RingBuffer;
use crate::ObjectId;
use glam::Vec3;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::BitOr;

/// Discrete buttons held during a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Buttons(u8);

impl Buttons {
    pub const NONE: Buttons = Buttons(0);
    pub const BOOST: Buttons = Buttons(1 << 0);
    pub const ABILITY: Buttons = Buttons(1 << 1);
    pub const CROUCH: Buttons = Buttons(1 << 2);
    pub const FIRE: Buttons = Buttons(1 << 3);

    pub fn from_bits(bits: u8) -> Self {
        Buttons(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Buttons) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Buttons) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Buttons) {
        self.0 &= !other.0;
    }
}

impl BitOr for Buttons {
    type Output = Buttons;

    fn bitor(self, rhs: Buttons) -> Buttons {
        Buttons(self.0 | rhs.0)
    }
}

/// One actor's intent for one simulation frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InputSample {
    pub frame: u32,
    pub object_id: ObjectId,
    pub movement: Vec3,
    pub buttons: Buttons,
}

impl InputSample {
    pub fn new(frame: u32, object_id: ObjectId, movement: Vec3, buttons: Buttons) -> Self {
        Self {
            frame,
            object_id,
            movement,
            buttons,
        }
    }

    /// No movement and no buttons.
    pub fn idle(frame: u32, object_id: ObjectId) -> Self {
        Self::new(frame, object_id, Vec3::ZERO, Buttons::NONE)
    }

    /// Same actor, same buttons and exactly equal movement. Frame numbers
    /// are ignored.
    ///
    /// Anything looser would let the server replay a run with the first
    /// sample's movement while the client predicted with the exact values.
    pub fn same_intent(&self, other: &InputSample) -> bool {
        self.object_id == other.object_id
            && self.buttons == other.buttons
            && self.movement == other.movement
    }
}

/// A sample standing for itself plus `duplicate_count` following frames with
/// the same intent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompressedInput {
    pub sample: InputSample,
    pub duplicate_count: u8,
}

impl CompressedInput {
    pub fn last_frame(&self) -> u32 {
        self.sample.frame.saturating_add(self.duplicate_count as u32)
    }
}

/// Run-length encodes samples whose frames are contiguous and whose intent
/// matches the first sample of the run.
pub fn compress_inputs(samples: &[InputSample]) -> Vec<CompressedInput> {
    let mut compressed: Vec<CompressedInput> = Vec::new();

    for sample in samples {
        if let Some(run) = compressed.last_mut() {
            let contiguous = run.last_frame().checked_add(1) == Some(sample.frame);
            if contiguous && run.duplicate_count < u8::MAX && run.sample.same_intent(sample) {
                run.duplicate_count += 1;
                continue;
            }
        }
        compressed.push(CompressedInput {
            sample: *sample,
            duplicate_count: 0,
        });
    }

    compressed
}

/// Expands every run back into one sample per covered frame.
pub fn decompress_inputs(compressed: &[CompressedInput]) -> Vec<InputSample> {
    let mut samples = Vec::new();
    for run in compressed {
        for offset in 0..=run.duplicate_count as u32 {
            if let Some(frame) = run.sample.frame.checked_add(offset) {
                samples.push(InputSample {
                    frame,
                    ..run.sample
                });
            }
        }
    }
    samples
}

/// Keeps one sample per (object, frame), the one appearing last in `samples`,
/// and returns them ordered by object then frame.
pub fn dedup_by_frame(samples: impl IntoIterator<Item = InputSample>) -> Vec<InputSample> {
    let mut unique = BTreeMap::new();
    for sample in samples {
        unique.insert((sample.object_id, sample.frame), sample);
    }
    unique.into_values().collect()
}

/// Bounded history of one actor's inputs, ordered by frame.
#[derive(Debug, Clone)]
pub struct InputBuffer {
    samples: RingBuffer<InputSample>,
}

impl InputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: RingBuffer::new(capacity),
        }
    }

    /// Appends a locally generated sample. Returns the evicted sample, if any.
    pub fn push(&mut self, sample: InputSample) -> Option<InputSample> {
        self.samples.push(sample)
    }

    pub fn get(&self, age: usize) -> Result<&InputSample> {
        self.samples.get(age)
    }

    pub fn newest(&self) -> Result<&InputSample> {
        self.samples.newest()
    }

    pub fn oldest(&self) -> Result<&InputSample> {
        self.samples.oldest()
    }

    pub fn by_frame(&self, frame: u32) -> Option<&InputSample> {
        self.samples.iter().rev().find(|sample| sample.frame == frame)
    }

    /// The last `count` samples, oldest first, for redundant sending.
    pub fn redundant(&self, count: usize) -> Vec<InputSample> {
        let skip = self.samples.len().saturating_sub(count);
        self.samples.iter().skip(skip).copied().collect()
    }

    /// Inserts a sample that arrived over the network, keeping frame order.
    ///
    /// A sample for a frame already held replaces the stored one. Returns
    /// `false` when the sample is older than everything a full buffer
    /// retains.
    pub fn insert_received(&mut self, sample: InputSample) -> bool {
        match self.samples.newest() {
            Err(_) => {
                self.samples.push(sample);
                return true;
            }
            Ok(newest) if newest.frame < sample.frame => {
                self.samples.push(sample);
                return true;
            }
            Ok(_) => {}
        }

        if let Some(existing) = self
            .samples
            .iter_mut()
            .find(|existing| existing.frame == sample.frame)
        {
            *existing = sample;
            return true;
        }

        let position = self
            .samples
            .iter()
            .position(|existing| existing.frame > sample.frame)
            .unwrap_or(self.samples.len());

        if position == 0 && self.samples.is_full() {
            return false;
        }

        self.samples.insert_at(position, sample);
        true
    }

    /// Samples with `watermark < frame <= through`, oldest first. A `None`
    /// watermark means nothing has been consumed yet.
    pub fn pending_after(&self, watermark: Option<u32>, through: u32) -> Vec<InputSample> {
        self.samples
            .iter()
            .filter(|sample| watermark.map_or(true, |mark| sample.frame > mark))
            .filter(|sample| sample.frame <= through)
            .copied()
            .collect()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &InputSample> + ExactSizeIterator {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.samples.capacity()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
