use std::fmt;
use std::str::FromStr;

/// Physical bus address of a device, as carried in every frame header.
///
/// Devices pick their own address; the daemon learns it during discovery.
/// Two values are reserved and never belong to a device: all-zero and the
/// all-`0xFF` broadcast address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PhysAddr(pub [u8; 8]);

impl PhysAddr {
    /// Size of an address on the wire.
    pub const LEN: usize = 8;
    /// The unset address.
    pub const ZERO: Self = Self([0x00; 8]);
    /// Every device on the bus accepts frames sent here.
    pub const BROADCAST: Self = Self([0xFF; 8]);

    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Zero or broadcast: never a device's own address.
    pub fn is_reserved(&self) -> bool {
        self.is_zero() || self.is_broadcast()
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({self})")
    }
}

/// Error parsing a [`PhysAddr`] from text.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AddrParseError {
    #[error("invalid hex in address: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("address must be {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
}

impl FromStr for PhysAddr {
    type Err = AddrParseError;

    /// Accepts `01:02:03:04:05:06:07:08`, `01-02-...` or 16 bare hex digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s
            .trim()
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .collect();
        let bytes = hex::decode(digits)?;
        let bytes: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| AddrParseError::Length {
                expected: Self::LEN,
                actual: bytes.len(),
            })?;
        Ok(Self(bytes))
    }
}

impl From<[u8; 8]> for PhysAddr {
    fn from(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }
}
