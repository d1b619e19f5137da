//! Composite keys and the order-preserving byte encoding used to store
//! them in an ordered backend.
//!
//! A `Key` is a sequence of `KeyPart`s. Two keys compare part-by-part; a
//! key that is a strict prefix of another sorts first. Within a part, the
//! encoding is chosen so that a plain `Vec<u8>` byte-compare (what every
//! ordered `Engine`/`Kv` backend does internally) always agrees with the
//! logical ordering in `KeyPart::cmp`. This is what lets `list()` do a
//! byte-range scan instead of decoding every candidate key.

use std::cmp::Ordering;
use std::fmt;

use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

/// One component of a composite key.
///
/// Fixed inter-type order: byte-string < text < integer < bigint <
/// boolean. Equal-typed parts compare by value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum KeyPart {
    Bytes(Vec<u8>),
    String(String),
    Int(i64),
    BigInt(BigInt),
    Bool(bool),
}

impl KeyPart {
    fn type_tag(&self) -> u8 {
        match self {
            KeyPart::Bytes(_) => 0,
            KeyPart::String(_) => 1,
            KeyPart::Int(_) => 2,
            KeyPart::BigInt(_) => 3,
            KeyPart::Bool(_) => 4,
        }
    }

    /// Encodes this part into `out`, preserving byte-order equivalence
    /// with `Ord`. Appends to `out` rather than returning a fresh vector
    /// so a whole `Key` can be encoded without intermediate allocations.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.type_tag());
        match self {
            KeyPart::Bytes(b) => encode_escaped(b, out),
            KeyPart::String(s) => encode_escaped(s.as_bytes(), out),
            KeyPart::Int(n) => {
                let flipped = (*n as u64) ^ 0x8000_0000_0000_0000;
                out.extend_from_slice(&flipped.to_be_bytes());
            }
            KeyPart::BigInt(n) => encode_bigint(n, out),
            KeyPart::Bool(b) => out.push(u8::from(*b)),
        }
    }

    /// Decodes a single part from the front of `input`, returning the
    /// part and the remaining bytes.
    pub fn decode_from(input: &[u8]) -> crate::error::CResult<(KeyPart, &[u8])> {
        let (&tag, rest) = input
            .split_first()
            .ok_or_else(|| crate::error::Error::Key("truncated key part".into()))?;
        match tag {
            0 => {
                let (bytes, rest) = decode_escaped(rest)?;
                Ok((KeyPart::Bytes(bytes), rest))
            }
            1 => {
                let (bytes, rest) = decode_escaped(rest)?;
                let s = String::from_utf8(bytes)
                    .map_err(|e| crate::error::Error::Key(format!("invalid utf8 key part: {e}")))?;
                Ok((KeyPart::String(s), rest))
            }
            2 => {
                if rest.len() < 8 {
                    return Err(crate::error::Error::Key("truncated int key part".into()));
                }
                let (head, rest) = rest.split_at(8);
                let flipped = u64::from_be_bytes(head.try_into().unwrap());
                let n = (flipped ^ 0x8000_0000_0000_0000) as i64;
                Ok((KeyPart::Int(n), rest))
            }
            3 => decode_bigint(rest),
            4 => {
                let (&b, rest) = rest
                    .split_first()
                    .ok_or_else(|| crate::error::Error::Key("truncated bool key part".into()))?;
                Ok((KeyPart::Bool(b != 0), rest))
            }
            other => Err(crate::error::Error::Key(format!("unknown key part tag {other}"))),
        }
    }
}

/// Escapes `0x00` as `0x00 0xFF` and terminates with `0x00 0x00`, so a
/// variable-length part remains self-delimiting inside a concatenated key.
fn encode_escaped(bytes: &[u8], out: &mut Vec<u8>) {
    for &b in bytes {
        if b == 0x00 {
            out.push(0x00);
            out.push(0xFF);
        } else {
            out.push(b);
        }
    }
    out.push(0x00);
    out.push(0x00);
}

fn decode_escaped(input: &[u8]) -> crate::error::CResult<(Vec<u8>, &[u8])> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            0x00 => match input.get(i + 1) {
                Some(0xFF) => {
                    out.push(0x00);
                    i += 2;
                }
                Some(0x00) => return Ok((out, &input[i + 2..])),
                _ => return Err(crate::error::Error::Key("malformed escaped key part".into())),
            },
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Err(crate::error::Error::Key("unterminated key part".into()))
}

/// Sign-and-magnitude encoding that keeps byte-compare equivalent to
/// mathematical ordering across arbitrary magnitudes.
///
/// Layout: `sign(1) [ len(4, be) magnitude(len) ]`. For negative numbers
/// the length is stored inverted (`u32::MAX - len`) and every magnitude
/// byte is bitwise-inverted, so a larger magnitude (a more negative
/// number) produces smaller encoded bytes.
fn encode_bigint(n: &BigInt, out: &mut Vec<u8>) {
    use num_bigint::Sign;
    let (sign, magnitude) = n.to_bytes_be();
    match sign {
        Sign::Minus => {
            out.push(0x00);
            let len = magnitude.len() as u32;
            out.extend_from_slice(&(u32::MAX - len).to_be_bytes());
            out.extend(magnitude.iter().map(|b| !b));
        }
        Sign::NoSign => {
            out.push(0x01);
        }
        Sign::Plus => {
            out.push(0x02);
            let len = magnitude.len() as u32;
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(&magnitude);
        }
    }
}

fn decode_bigint(input: &[u8]) -> crate::error::CResult<(KeyPart, &[u8])> {
    let (&sign, rest) = input
        .split_first()
        .ok_or_else(|| crate::error::Error::Key("truncated bigint key part".into()))?;
    match sign {
        0x01 => Ok((KeyPart::BigInt(BigInt::from(0)), rest)),
        0x00 | 0x02 => {
            if rest.len() < 4 {
                return Err(crate::error::Error::Key("truncated bigint length".into()));
            }
            let (len_bytes, rest) = rest.split_at(4);
            let raw_len = u32::from_be_bytes(len_bytes.try_into().unwrap());
            let len = if sign == 0x00 { u32::MAX - raw_len } else { raw_len } as usize;
            if rest.len() < len {
                return Err(crate::error::Error::Key("truncated bigint magnitude".into()));
            }
            let (mag, rest) = rest.split_at(len);
            let magnitude: Vec<u8> = if sign == 0x00 {
                mag.iter().map(|b| !b).collect()
            } else {
                mag.to_vec()
            };
            let value = if sign == 0x00 {
                -BigInt::from_bytes_be(num_bigint::Sign::Plus, &magnitude)
            } else {
                BigInt::from_bytes_be(num_bigint::Sign::Plus, &magnitude)
            };
            Ok((KeyPart::BigInt(value), rest))
        }
        other => Err(crate::error::Error::Key(format!("unknown bigint sign tag {other}"))),
    }
}

impl PartialEq for KeyPart {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for KeyPart {}

impl PartialOrd for KeyPart {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyPart {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (KeyPart::Bytes(a), KeyPart::Bytes(b)) => a.cmp(b),
            (KeyPart::String(a), KeyPart::String(b)) => a.as_bytes().cmp(b.as_bytes()),
            (KeyPart::Int(a), KeyPart::Int(b)) => a.cmp(b),
            (KeyPart::BigInt(a), KeyPart::BigInt(b)) => a.cmp(b),
            (KeyPart::Bool(a), KeyPart::Bool(b)) => a.cmp(b),
            _ => self.type_tag().cmp(&other.type_tag()),
        }
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Bytes(b) => write!(f, "{}", hex_encode(b)),
            KeyPart::String(s) => write!(f, "{s}"),
            KeyPart::Int(n) => write!(f, "{n}"),
            KeyPart::BigInt(n) => write!(f, "{n}"),
            KeyPart::Bool(b) => write!(f, "{b}"),
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl From<&str> for KeyPart {
    fn from(s: &str) -> Self {
        KeyPart::String(s.to_string())
    }
}
impl From<String> for KeyPart {
    fn from(s: String) -> Self {
        KeyPart::String(s)
    }
}
impl From<i64> for KeyPart {
    fn from(n: i64) -> Self {
        KeyPart::Int(n)
    }
}
impl From<BigInt> for KeyPart {
    fn from(n: BigInt) -> Self {
        KeyPart::BigInt(n)
    }
}
impl From<bool> for KeyPart {
    fn from(b: bool) -> Self {
        KeyPart::Bool(b)
    }
}
impl From<Vec<u8>> for KeyPart {
    fn from(b: Vec<u8>) -> Self {
        KeyPart::Bytes(b)
    }
}

/// An ordered sequence of `KeyPart`s. Equal prefixes sort first (a key
/// with fewer parts is "less than" an extension of itself with more
/// parts), matching the layout in spec §3.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key(pub Vec<KeyPart>);

impl Key {
    pub fn new(parts: Vec<KeyPart>) -> Self {
        Key(parts)
    }

    pub fn push(mut self, part: impl Into<KeyPart>) -> Self {
        self.0.push(part.into());
        self
    }

    pub fn extend(mut self, other: &Key) -> Self {
        self.0.extend(other.0.iter().cloned());
        self
    }

    /// Encodes the whole key into an order-preserving byte string
    /// suitable as a map key in any ordered backend.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for part in &self.0 {
            part.encode_into(&mut out);
        }
        out
    }

    pub fn decode(mut bytes: &[u8]) -> crate::error::CResult<Self> {
        let mut parts = Vec::new();
        while !bytes.is_empty() {
            let (part, rest) = KeyPart::decode_from(bytes)?;
            parts.push(part);
            bytes = rest;
        }
        Ok(Key(parts))
    }

    /// True if `self` is `other` with zero or more parts appended.
    pub fn starts_with(&self, other: &Key) -> bool {
        self.0.len() >= other.0.len() && self.0[..other.0.len()] == other.0[..]
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}
impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The exclusive end of a prefix range: the smallest key that is
/// lexicographically greater than every key sharing `prefix` as a
/// prefix, expressed over the *encoded* byte representation (mirrors
/// `Engine::scan_prefix` in `storage::engine`).
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    match prefix.iter().rposition(|&b| b != 0xff) {
        Some(i) => {
            let mut end = prefix[..=i].to_vec();
            end[i] += 1;
            Some(end)
        }
        None => None,
    }
}

/// A monotone token minted by the backing KV on every write. Rendered as
/// zero-padded hex text, as spec §4.4 describes ("monotone text tokens
/// generated from a local counter") while remaining cheap to compare and
/// order internally.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Versionstamp(pub u64);

impl fmt::Display for Versionstamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:020x}", self.0)
    }
}

impl Versionstamp {
    pub fn next(self) -> Self {
        Versionstamp(self.0 + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(parts: Vec<KeyPart>) -> Vec<u8> {
        Key::new(parts).encode()
    }

    #[test]
    fn round_trips_each_part_kind() {
        let parts = vec![
            KeyPart::Bytes(vec![1, 0, 2]),
            KeyPart::String("hello\u{0}world".into()),
            KeyPart::Int(-42),
            KeyPart::BigInt(BigInt::from(123456789012345678_i128)),
            KeyPart::Bool(true),
        ];
        let key = Key::new(parts.clone());
        let decoded = Key::decode(&key.encode()).unwrap();
        assert_eq!(decoded.0, parts);
    }

    #[test]
    fn inter_type_order_matches_spec() {
        // byte-string < text < integer < bigint < boolean
        let b = enc(vec![KeyPart::Bytes(vec![0xff])]);
        let s = enc(vec![KeyPart::String("a".into())]);
        let i = enc(vec![KeyPart::Int(i64::MAX)]);
        let big = enc(vec![KeyPart::BigInt(BigInt::from(1))]);
        let t = enc(vec![KeyPart::Bool(false)]);
        assert!(b < s);
        assert!(s < i);
        assert!(i < big);
        assert!(big < t);
    }

    #[test]
    fn int_order_preserving() {
        let values = [i64::MIN, -1000, -1, 0, 1, 1000, i64::MAX];
        let mut encoded: Vec<Vec<u8>> = values.iter().map(|&n| enc(vec![KeyPart::Int(n)])).collect();
        let sorted = {
            let mut s = encoded.clone();
            s.sort();
            s
        };
        assert_eq!(encoded, sorted);
        encoded.clear();
    }

    #[test]
    fn bigint_order_preserving() {
        let values: Vec<BigInt> = vec![
            BigInt::from(-10_000_000_000_i64),
            BigInt::from(-5),
            BigInt::from(0),
            BigInt::from(5),
            BigInt::from(10_000_000_000_i64),
        ];
        let encoded: Vec<Vec<u8>> = values.iter().map(|n| enc(vec![KeyPart::BigInt(n.clone())])).collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn bool_order_preserving() {
        assert!(enc(vec![KeyPart::Bool(false)]) < enc(vec![KeyPart::Bool(true)]));
    }

    #[test]
    fn prefix_of_key_sorts_first() {
        let base = Key::new(vec![KeyPart::String("users".into())]);
        let extended = base.clone().push("id").push("abc");
        assert!(base.encode() < extended.encode());
        assert!(extended.starts_with(&base));
    }

    #[test]
    fn prefix_end_flips_trailing_non_ff_byte() {
        assert_eq!(prefix_end(&[1, 2, 3]), Some(vec![1, 2, 4]));
        assert_eq!(prefix_end(&[1, 0xff, 0xff]), Some(vec![2]));
        assert_eq!(prefix_end(&[0xff, 0xff]), None);
    }
}
