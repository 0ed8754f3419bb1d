//! Fixed-size byte types and the 256-bit unsigned integer used for amounts.
//!
//! Everything crossing the API boundary (channel results, amounts) is
//! serialized as `0x`-prefixed lower-case hex strings, so values produced by
//! different wallets compare equal as strings, too.

use core::fmt::{self, Debug, Display};
use core::str::FromStr;
use rand::{distributions::Standard, prelude::Distribution};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use uint::{
    construct_uint,
    hex::{FromHex, ToHex},
};

/// Error returned when parsing hex encoded bytes or amounts fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("expected {expected} bytes, got {actual}")]
    ByteLength { expected: usize, actual: usize },
    #[error("invalid hex string")]
    InvalidHex,
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
}

macro_rules! impl_hex_debug {
    ($T:ident) => {
        impl Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("0x")?;
                for b in self.0 {
                    f.write_fmt(format_args!("{:02x}", b))?;
                }
                Ok(())
            }
        }

        impl Display for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                Debug::fmt(self, f)
            }
        }
    };
}

macro_rules! bytesN {
    ( $T:ident, $N:literal ) => {
        #[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone)]
        pub struct $T(pub [u8; $N]);

        impl $T {
            pub const LEN: usize = $N;

            pub fn from_slice(bytes: &[u8]) -> Result<Self, ParseError> {
                let arr: [u8; $N] = bytes.try_into().map_err(|_| ParseError::ByteLength {
                    expected: $N,
                    actual: bytes.len(),
                })?;
                Ok(Self(arr))
            }

            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }

            pub fn to_hex(&self) -> String {
                format!("0x{}", self.0.encode_hex::<String>())
            }
        }

        impl FromStr for $T {
            type Err = ParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.strip_prefix("0x").unwrap_or(s);
                let bytes = Vec::<u8>::from_hex(s).map_err(|_| ParseError::InvalidHex)?;
                Self::from_slice(&bytes)
            }
        }

        impl Serialize for $T {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $T {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(de::Error::custom)
            }
        }

        impl Distribution<$T> for Standard {
            fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> $T {
                let mut buf = [0u8; $N];
                rng.fill(&mut buf[..]);
                $T(buf)
            }
        }

        impl Default for $T {
            fn default() -> Self {
                Self([0; $N])
            }
        }

        impl_hex_debug!($T);
    };
}

bytesN!(Address, 20);
bytesN!(Hash, 32);
bytesN!(Destination, 32);
bytesN!(Signature, 65);

impl Signature {
    pub fn new(rs: &[u8; 64], v: u8) -> Self {
        let mut sig: Signature = Signature([0; 65]);
        sig.0[..64].copy_from_slice(rs);
        sig.0[64] = v;
        sig
    }
}

/// Participants receive funds on their signing address, left-padded to 32
/// bytes. Application channels funded by a ledger use their channel id.
impl From<Address> for Destination {
    fn from(addr: Address) -> Self {
        let mut bytes = [0u8; 32];
        bytes[32 - 20..].copy_from_slice(&addr.0);
        Destination(bytes)
    }
}

impl From<Hash> for Destination {
    fn from(id: Hash) -> Self {
        Destination(id.0)
    }
}

impl Destination {
    /// Whether this destination refers to an external address (12 leading
    /// zero bytes) rather than a channel id.
    pub fn is_external(&self) -> bool {
        self.0[..12].iter().all(|b| *b == 0)
    }
}

construct_uint! {
    pub struct U256(4);
}

/// All amounts are unsigned 256-bit integers, no fractional units.
pub type Amount = U256;

impl U256 {
    pub fn to_be_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        self.to_big_endian(&mut bytes);
        bytes
    }

    /// Decodes a big-endian integer of at most 32 bytes.
    pub fn from_be_slice(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() > 32 {
            return Err(ParseError::ByteLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        Ok(U256::from_big_endian(bytes))
    }

    /// Hex representation without leading zeros, `0x0` for zero.
    pub fn to_hex_string(&self) -> String {
        format!("0x{:x}", self)
    }
}

/// Parses an amount given either as `0x`-prefixed hex or as a decimal string.
pub fn parse_amount(s: &str) -> Result<Amount, ParseError> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x") {
        Some(hex) if !hex.is_empty() => U256::from_str_radix(hex, 16).ok(),
        Some(_) => None,
        None => U256::from_dec_str(s).ok(),
    };
    parsed.ok_or_else(|| ParseError::InvalidAmount(s.to_string()))
}

impl Serialize for U256 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex_string())
    }
}

impl<'de> Deserialize<'de> for U256 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_amount(&s).map_err(de::Error::custom)
    }
}

impl Distribution<U256> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> U256 {
        let buf: [u8; 32] = rng.gen();
        U256::from_big_endian(&buf)
    }
}
