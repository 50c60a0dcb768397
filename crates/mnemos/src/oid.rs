//! 96-bit globally unique object identifiers.
//!
//! An [`Oid`] is a pair `hi: u64` / `lo: u32`. Its textual form is an
//! underscore followed by 22 base-62 digits (alphabet `0-9A-Za-z`): the
//! first 11 digits encode `hi`, the last 11 encode `lo`, zero-padded, most
//! significant digit first. Because both halves are zero-padded, textual
//! order equals `(hi, lo)` order, so sorting id strings and sorting ids
//! agree everywhere (space files, generated headers, set values).
//!
//! An id is valid iff `hi != 0`, `lo != 0`, and the textual form
//! round-trips. Fresh ids are drawn from the OS entropy source with
//! rejection sampling.

use std::{
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
};

use rand::{rngs::OsRng, Rng};

use crate::error::PersistError;

/// The base-62 digit alphabet, in ascending order.
pub const B62_DIGITS: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Number of base-62 digits in the textual form (not counting the `_`).
pub const OID_NB_DIGITS: usize = 22;

/// Total byte length of the textual form: `_` plus 22 digits.
pub const OID_NB_CHARS: usize = OID_NB_DIGITS + 1;

const HI_DIGITS: usize = 11;

/// A 96-bit globally unique object identifier.
///
/// `Oid` is `Copy` and totally ordered; identity of persisted objects is
/// defined by it. The null reference is *not* an `Oid`; see
/// [`ObjectRef`](crate::object::ObjectRef) for the nullable handle.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Oid {
    hi: u64,
    lo: u32,
}

impl Oid {
    /// Builds an id from its two halves, or `None` if either half is zero.
    #[must_use]
    pub fn from_parts(hi: u64, lo: u32) -> Option<Self> {
        if hi == 0 || lo == 0 {
            return None;
        }
        Some(Self { hi, lo })
    }

    /// The high 64 bits.
    #[must_use]
    pub fn hi(self) -> u64 {
        self.hi
    }

    /// The low 32 bits.
    #[must_use]
    pub fn lo(self) -> u32 {
        self.lo
    }

    /// Draws a fresh random id from the OS entropy source.
    ///
    /// Rejection-samples until both halves are nonzero, which in practice
    /// terminates on the first draw.
    #[must_use]
    pub fn random() -> Self {
        loop {
            let hi: u64 = OsRng.gen();
            let lo: u32 = OsRng.gen();
            if let Some(oid) = Self::from_parts(hi, lo) {
                return oid;
            }
        }
    }

    /// Parses the 23-byte textual form.
    ///
    /// # Errors
    /// `InvalidIdString` for a wrong length, a missing leading underscore, a
    /// character outside the base-62 alphabet, an overflowing half, or a
    /// zero half.
    pub fn parse(input: &str) -> Result<Self, PersistError> {
        let bad = |reason: &'static str| PersistError::InvalidIdString {
            input: input.to_owned(),
            reason,
        };
        let bytes = input.as_bytes();
        if bytes.len() != OID_NB_CHARS {
            return Err(bad("length must be 23"));
        }
        if bytes[0] != b'_' {
            return Err(bad("must start with '_'"));
        }
        let hi = decode_b62(&bytes[1..1 + HI_DIGITS], u128::from(u64::MAX)).ok_or_else(|| bad("bad high half"))?;
        let lo = decode_b62(&bytes[1 + HI_DIGITS..], u128::from(u32::MAX)).ok_or_else(|| bad("bad low half"))?;
        #[expect(clippy::cast_possible_truncation, reason = "both halves are range-checked above")]
        let (hi, lo) = (hi as u64, lo as u32);
        Self::from_parts(hi, lo).ok_or_else(|| bad("zero half"))
    }

    /// Returns `true` when `input` has the exact shape of an id string:
    /// 23 bytes, leading `_`, every remaining byte in the base-62 alphabet.
    ///
    /// This is the test the value deserializer uses to distinguish an
    /// object reference from a plain string, so it deliberately does not
    /// check half ranges.
    #[must_use]
    pub fn looks_like_id(input: &str) -> bool {
        let bytes = input.as_bytes();
        bytes.len() == OID_NB_CHARS
            && bytes[0] == b'_'
            && bytes[1..].iter().all(|b| digit_value(*b).is_some())
    }

    /// A stable 32-bit hash, derived from both halves.
    ///
    /// Never returns zero, so callers may use zero as an "unhashed"
    /// sentinel.
    #[must_use]
    pub fn hash32(self) -> u32 {
        let mixed = (self.hi ^ u64::from(self.lo).rotate_left(32)).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        #[expect(clippy::cast_possible_truncation, reason = "intentional 32-bit fold")]
        let folded = (mixed ^ (mixed >> 32)) as u32;
        if folded == 0 { 0x9E37_79B9 } else { folded }
    }
}

fn digit_value(byte: u8) -> Option<u32> {
    match byte {
        b'0'..=b'9' => Some(u32::from(byte - b'0')),
        b'A'..=b'Z' => Some(u32::from(byte - b'A') + 10),
        b'a'..=b'z' => Some(u32::from(byte - b'a') + 36),
        _ => None,
    }
}

fn decode_b62(digits: &[u8], max: u128) -> Option<u128> {
    let mut acc: u128 = 0;
    for &byte in digits {
        acc = acc.checked_mul(62)?.checked_add(u128::from(digit_value(byte)?))?;
        if acc > max {
            return None;
        }
    }
    Some(acc)
}

fn encode_b62(mut value: u128, out: &mut [u8]) {
    for slot in out.iter_mut().rev() {
        *slot = B62_DIGITS[(value % 62) as usize];
        value /= 62;
    }
    debug_assert_eq!(value, 0);
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = [b'0'; OID_NB_CHARS];
        buf[0] = b'_';
        encode_b62(u128::from(self.hi), &mut buf[1..1 + HI_DIGITS]);
        encode_b62(u128::from(self.lo), &mut buf[1 + HI_DIGITS..]);
        // buf only ever holds '_' and base-62 digits
        f.write_str(std::str::from_utf8(&buf).expect("oid digits are ASCII"))
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({self})")
    }
}

impl Hash for Oid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hi.hash(state);
        self.lo.hash(state);
    }
}

impl FromStr for Oid {
    type Err = PersistError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Oid {
    type Error = PersistError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Oid> for String {
    fn from(oid: Oid) -> Self {
        oid.to_string()
    }
}
