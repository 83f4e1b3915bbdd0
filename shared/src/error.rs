//! Error taxonomy shared by every netcode component.
//!
//! None of these conditions is fatal. Ring-buffer and lookup errors signal a
//! caller bug or an empty buffer and must be handled explicitly; the rest
//! describe stale or unknown data arriving from the network, which callers
//! recover from by skipping the entry or applying state without replay.

use crate::physics::BodyHandle;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetcodeError {
    /// Requested age is beyond the retained history.
    #[error("age {age} out of range for buffer holding {size} items")]
    OutOfRange { age: usize, size: usize },

    /// Query against a buffer that has never been written.
    #[error("buffer is empty")]
    EmptyBuffer,

    /// Authoritative frame is too far behind the local frame to replay.
    #[error("snapshot for frame {frame} is stale (current frame {current}, replay limit {limit})")]
    StaleSnapshot { frame: u32, current: u32, limit: u32 },

    /// Fixed-step catch-up hit the per-tick cap; `dropped` whole steps of
    /// wall time were discarded.
    #[error("simulation stalled: ran {executed} steps, dropped {dropped} pending steps")]
    SimulationStall { executed: u32, dropped: u32 },

    /// Input or state references an object that is not simulated.
    #[error("unknown object id {0}")]
    InvalidObjectId(u32),

    /// Handle refers to a body slot that has been removed or recycled.
    #[error("stale body handle {0:?}")]
    StaleBodyHandle(BodyHandle),
}

pub type Result<T> = std::result::Result<T, NetcodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = NetcodeError::OutOfRange { age: 3, size: 3 };
        assert_eq!(err.to_string(), "age 3 out of range for buffer holding 3 items");

        let err = NetcodeError::SimulationStall {
            executed: 8,
            dropped: 22,
        };
        assert!(err.to_string().contains("dropped 22"));

        assert_eq!(
            NetcodeError::InvalidObjectId(7).to_string(),
            "unknown object id 7"
        );
    }
}
