//! Reference encodings
//!
//! A reference slot holds either a full 64-bit address (wide) or a 32-bit
//! scaled offset from a base address (narrow). The encoding is chosen once
//! per dump or load session; zero always means null.

use crate::object::Address;
use crate::{ArchiveError, ArchiveResult};
use std::fmt;

/// Largest supported narrow shift
pub const MAX_NARROW_SHIFT: u32 = 3;

/// Encoder/decoder for reference slots
pub trait ReferenceCodec {
    /// Width of a reference slot in bytes
    fn ref_size(&self) -> usize;

    /// Encode an address into a raw slot value (null encodes as 0)
    fn encode(&self, addr: Address) -> ArchiveResult<u64>;

    /// Decode a raw slot value (0 decodes as null)
    fn decode(&self, raw: u64) -> Address;

    /// Base address subtracted before scaling
    fn base(&self) -> Address;

    /// Scale shift applied after subtracting the base
    fn shift(&self) -> u32;
}

/// 64-bit absolute references
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct WideCodec;

impl ReferenceCodec for WideCodec {
    fn ref_size(&self) -> usize {
        8
    }

    fn encode(&self, addr: Address) -> ArchiveResult<u64> {
        Ok(addr.as_u64())
    }

    fn decode(&self, raw: u64) -> Address {
        Address::new(raw)
    }

    fn base(&self) -> Address {
        Address::NULL
    }

    fn shift(&self) -> u32 {
        0
    }
}

/// 32-bit references stored as `(addr - base) >> shift`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NarrowCodec {
    base: Address,
    shift: u32,
}

impl NarrowCodec {
    /// Create a narrow codec; `shift` must not exceed [`MAX_NARROW_SHIFT`]
    pub fn new(base: Address, shift: u32) -> ArchiveResult<Self> {
        if shift > MAX_NARROW_SHIFT {
            return Err(ArchiveError::IncompatibleEncoding(format!(
                "narrow shift {} exceeds {}",
                shift, MAX_NARROW_SHIFT
            )));
        }
        Ok(Self { base, shift })
    }

    /// Highest address this codec can represent
    pub fn max_address(&self) -> u64 {
        self.base
            .as_u64()
            .saturating_add((u32::MAX as u64) << self.shift)
    }
}

impl ReferenceCodec for NarrowCodec {
    fn ref_size(&self) -> usize {
        4
    }

    fn encode(&self, addr: Address) -> ArchiveResult<u64> {
        if addr.is_null() {
            return Ok(0);
        }
        let offset = addr
            .offset_from(self.base)
            .ok_or_else(|| unencodable(addr, "below the narrow base"))?;
        if offset & ((1u64 << self.shift) - 1) != 0 {
            return Err(unencodable(addr, "misaligned for the narrow shift"));
        }
        let raw = offset >> self.shift;
        if raw == 0 {
            return Err(unencodable(addr, "collides with the null encoding"));
        }
        if raw > u32::MAX as u64 {
            return Err(unencodable(addr, "beyond the narrow range"));
        }
        Ok(raw)
    }

    fn decode(&self, raw: u64) -> Address {
        if raw == 0 {
            Address::NULL
        } else {
            Address::new(self.base.as_u64() + (raw << self.shift))
        }
    }

    fn base(&self) -> Address {
        self.base
    }

    fn shift(&self) -> u32 {
        self.shift
    }
}

fn unencodable(address: Address, reason: &str) -> ArchiveError {
    ArchiveError::UnencodableReference {
        address,
        reason: reason.to_string(),
    }
}

/// Encoding selected for a session
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReferenceEncoding {
    /// 64-bit absolute references
    Wide,
    /// 32-bit scaled references
    Narrow {
        /// Narrow base address
        base: u64,
        /// Narrow shift (0..=3)
        shift: u32,
    },
}

impl ReferenceEncoding {
    /// Build the codec for this encoding
    pub fn codec(&self) -> ArchiveResult<SessionCodec> {
        match *self {
            ReferenceEncoding::Wide => Ok(SessionCodec::Wide(WideCodec)),
            ReferenceEncoding::Narrow { base, shift } => Ok(SessionCodec::Narrow(
                NarrowCodec::new(Address::new(base), shift)?,
            )),
        }
    }

    /// Width of a reference slot in bytes
    pub fn ref_size(&self) -> usize {
        match self {
            ReferenceEncoding::Wide => 8,
            ReferenceEncoding::Narrow { .. } => 4,
        }
    }

    /// Check if this is the narrow encoding
    pub fn is_narrow(&self) -> bool {
        matches!(self, ReferenceEncoding::Narrow { .. })
    }
}

impl Default for ReferenceEncoding {
    fn default() -> Self {
        ReferenceEncoding::Narrow { base: 0, shift: 3 }
    }
}

impl fmt::Display for ReferenceEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferenceEncoding::Wide => write!(f, "wide"),
            ReferenceEncoding::Narrow { base, shift } => {
                write!(f, "narrow(base={:#x}, shift={})", base, shift)
            }
        }
    }
}

/// Codec chosen at run time for one session
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionCodec {
    /// Wide references
    Wide(WideCodec),
    /// Narrow references
    Narrow(NarrowCodec),
}

impl ReferenceCodec for SessionCodec {
    fn ref_size(&self) -> usize {
        match self {
            SessionCodec::Wide(c) => c.ref_size(),
            SessionCodec::Narrow(c) => c.ref_size(),
        }
    }

    fn encode(&self, addr: Address) -> ArchiveResult<u64> {
        match self {
            SessionCodec::Wide(c) => c.encode(addr),
            SessionCodec::Narrow(c) => c.encode(addr),
        }
    }

    fn decode(&self, raw: u64) -> Address {
        match self {
            SessionCodec::Wide(c) => c.decode(raw),
            SessionCodec::Narrow(c) => c.decode(raw),
        }
    }

    fn base(&self) -> Address {
        match self {
            SessionCodec::Wide(c) => c.base(),
            SessionCodec::Narrow(c) => c.base(),
        }
    }

    fn shift(&self) -> u32 {
        match self {
            SessionCodec::Wide(c) => c.shift(),
            SessionCodec::Narrow(c) => c.shift(),
        }
    }
}
