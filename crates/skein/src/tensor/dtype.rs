//! Enumerates the scalar element types carried by tensor buffers.

use serde::{Deserialize, Serialize};

/// Logical dtype identifier shared between buffers, graph values, and the
/// C boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit floating point following IEEE-754 semantics.
    F32,
    /// 32-bit signed integer, primarily for index data.
    I32,
    /// 8-bit unsigned integer, for raw byte payloads.
    U8,
}

impl DType {
    /// Returns the number of bytes required per scalar element.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::I32 => 4,
            DType::U8 => 1,
        }
    }

    /// Produces a stable tag used when crossing the C boundary.
    pub fn tag(self) -> u32 {
        match self {
            DType::F32 => 0,
            DType::I32 => 1,
            DType::U8 => 2,
        }
    }

    /// Reconstructs a `DType` from its boundary tag.
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(DType::F32),
            1 => Some(DType::I32),
            2 => Some(DType::U8),
            _ => None,
        }
    }
}
