//! KNX individual address.
//!
//! A tunneling server hands every tunnel its own individual address, reported
//! in the last two bytes of the tunneling CRD. Format: `Area.Line.Device`
//! - Area: 0-15 (4 bits)
//! - Line: 0-15 (4 bits)
//! - Device: 0-255 (8 bits)

use core::fmt;

use crate::error::{KnxError, Result};

/// KNX Individual Address (Area.Line.Device)
///
/// # Examples
///
/// ```
/// use knx_tunnel::IndividualAddress;
///
/// let addr = IndividualAddress::new(1, 1, 5).unwrap();
/// assert_eq!(addr.to_string(), "1.1.5");
/// assert_eq!(u16::from(addr), 0x1105);
///
/// let parsed: IndividualAddress = "1.1.5".parse().unwrap();
/// assert_eq!(parsed, addr);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IndividualAddress {
    raw: u16,
}

impl IndividualAddress {
    /// Size of the encoded address
    pub const SIZE: usize = 2;
    /// Maximum area value (4 bits)
    pub const MAX_AREA: u8 = 15;
    /// Maximum line value (4 bits)
    pub const MAX_LINE: u8 = 15;

    /// Build an address from its components.
    ///
    /// Returns `None` if area or line exceed 15.
    pub const fn new(area: u8, line: u8, device: u8) -> Option<Self> {
        if area > Self::MAX_AREA || line > Self::MAX_LINE {
            return None;
        }
        Some(Self {
            raw: ((area as u16) << 12) | ((line as u16) << 8) | device as u16,
        })
    }

    /// Raw 16-bit value
    #[inline(always)]
    pub const fn raw(self) -> u16 {
        self.raw
    }

    /// Area component (0-15)
    #[inline(always)]
    pub const fn area(self) -> u8 {
        ((self.raw >> 12) & 0x0F) as u8
    }

    /// Line component (0-15)
    #[inline(always)]
    pub const fn line(self) -> u8 {
        ((self.raw >> 8) & 0x0F) as u8
    }

    /// Device component (0-255)
    #[inline(always)]
    pub const fn device(self) -> u8 {
        (self.raw & 0xFF) as u8
    }

    /// Decode a big-endian address at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `BufferTooSmall` if fewer than two bytes remain.
    pub fn decode(data: &[u8], offset: usize) -> Result<(Self, usize)> {
        match data.get(offset..offset.saturating_add(Self::SIZE)) {
            Some(&[hi, lo]) => Ok((Self::from(u16::from_be_bytes([hi, lo])), Self::SIZE)),
            _ => Err(KnxError::buffer_too_small()),
        }
    }

    /// Encode as big-endian bytes
    #[inline]
    pub const fn to_bytes(self) -> [u8; Self::SIZE] {
        self.raw.to_be_bytes()
    }
}

impl fmt::Display for IndividualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.area(), self.line(), self.device())
    }
}

impl From<u16> for IndividualAddress {
    #[inline(always)]
    fn from(raw: u16) -> Self {
        Self { raw }
    }
}

impl From<IndividualAddress> for u16 {
    #[inline(always)]
    fn from(addr: IndividualAddress) -> u16 {
        addr.raw
    }
}

impl core::str::FromStr for IndividualAddress {
    type Err = KnxError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('.').map(|part| part.parse::<u8>().ok());

        let (Some(Some(area)), Some(Some(line)), Some(Some(device)), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(KnxError::invalid_address());
        };

        Self::new(area, line, device).ok_or_else(KnxError::invalid_address)
    }
}
