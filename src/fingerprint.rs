//! Content Fingerprints
//!
//! A fingerprint is the self-describing identifier every layer keys on:
//! version tag, codec tag, hash algorithm tag, and digest bytes. Two
//! fingerprints are equal iff all four match bytewise. The canonical string
//! form is lowercase base32 (no padding) of the binary form and doubles as
//! the on-disk filename encoding.

use crate::error::{Error, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::str::FromStr;

const FINGERPRINT_VERSION: u8 = 1;

/// Base32 alphabet shared by encode and parse
const BASE32_ALPHABET: base32::Alphabet = base32::Alphabet::RFC4648 { padding: false };

// =============================================================================
// Codec
// =============================================================================

/// Content codec carried inside the fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Codec {
    /// Raw bytes
    #[default]
    Raw,
    /// Merkle-DAG protobuf framing
    DagPb,
    /// Merkle-DAG CBOR framing
    DagCbor,
}

impl Codec {
    pub fn tag(&self) -> u8 {
        match self {
            Codec::Raw => 0x55,
            Codec::DagPb => 0x70,
            Codec::DagCbor => 0x71,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x55 => Some(Codec::Raw),
            0x70 => Some(Codec::DagPb),
            0x71 => Some(Codec::DagCbor),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::Raw => "raw",
            Codec::DagPb => "dag-pb",
            Codec::DagCbor => "dag-cbor",
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Hash Algorithm
// =============================================================================

/// Digest algorithm carried inside the fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum HashAlgorithm {
    #[default]
    Sha2_256,
    Sha2_512,
}

impl HashAlgorithm {
    pub fn tag(&self) -> u8 {
        match self {
            HashAlgorithm::Sha2_256 => 0x12,
            HashAlgorithm::Sha2_512 => 0x13,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x12 => Some(HashAlgorithm::Sha2_256),
            0x13 => Some(HashAlgorithm::Sha2_512),
            _ => None,
        }
    }

    pub fn digest_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha2_256 => 32,
            HashAlgorithm::Sha2_512 => 64,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha2_256 => "sha2-256",
            HashAlgorithm::Sha2_512 => "sha2-512",
        }
    }

    /// Digest arbitrary bytes with this algorithm
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha2_256 => Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha2_512 => Sha512::digest(data).to_vec(),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Fingerprint
// =============================================================================

/// Self-describing content identifier; the cache key everywhere
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint {
    version: u8,
    codec: Codec,
    hash: HashAlgorithm,
    digest: Box<[u8]>,
}

impl Fingerprint {
    /// Fingerprint raw bytes with the default codec and SHA-256
    pub fn of(data: &[u8]) -> Self {
        Self::of_with(data, Codec::Raw, HashAlgorithm::Sha2_256)
    }

    /// Fingerprint bytes with an explicit codec and hash algorithm
    pub fn of_with(data: &[u8], codec: Codec, hash: HashAlgorithm) -> Self {
        Self {
            version: FINGERPRINT_VERSION,
            codec,
            hash,
            digest: hash.digest(data).into_boxed_slice(),
        }
    }

    /// Rebuild from parts (e.g. a digest computed elsewhere)
    pub fn from_parts(codec: Codec, hash: HashAlgorithm, digest: Vec<u8>) -> Result<Self> {
        if digest.len() != hash.digest_len() {
            return Err(Error::FingerprintParse(format!(
                "digest length {} does not match {}",
                digest.len(),
                hash
            )));
        }
        Ok(Self {
            version: FINGERPRINT_VERSION,
            codec,
            hash,
            digest: digest.into_boxed_slice(),
        })
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.hash
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    /// Binary form: version, codec tag, hash tag, digest length, digest
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.digest.len());
        out.push(self.version);
        out.push(self.codec.tag());
        out.push(self.hash.tag());
        out.push(self.digest.len() as u8);
        out.extend_from_slice(&self.digest);
        out
    }

    /// Parse the binary form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(Error::FingerprintParse("truncated fingerprint".into()));
        }
        if bytes[0] != FINGERPRINT_VERSION {
            return Err(Error::FingerprintParse(format!(
                "unknown fingerprint version {}",
                bytes[0]
            )));
        }
        let codec = Codec::from_tag(bytes[1])
            .ok_or_else(|| Error::FingerprintParse(format!("unknown codec tag {:#x}", bytes[1])))?;
        let hash = HashAlgorithm::from_tag(bytes[2]).ok_or_else(|| {
            Error::FingerprintParse(format!("unknown hash algorithm tag {:#x}", bytes[2]))
        })?;
        let len = bytes[3] as usize;
        let digest = &bytes[4..];
        if digest.len() != len || len != hash.digest_len() {
            return Err(Error::FingerprintParse(format!(
                "digest length {} does not match declared {} for {}",
                digest.len(),
                len,
                hash
            )));
        }
        Ok(Self {
            version: bytes[0],
            codec,
            hash,
            digest: digest.to_vec().into_boxed_slice(),
        })
    }

    /// Canonical string form; also the filesystem-safe encoding
    pub fn to_canonical_string(&self) -> String {
        base32::encode(BASE32_ALPHABET, &self.to_bytes()).to_lowercase()
    }

    /// Shard index for sharded maps (low bits of the digest)
    #[inline]
    pub fn shard_index(&self, shard_count: usize) -> usize {
        debug_assert!(shard_count.is_power_of_two());
        let mut acc = [0u8; 8];
        acc.copy_from_slice(&self.digest[..8]);
        (u64::from_le_bytes(acc) as usize) & (shard_count - 1)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_canonical_string())
    }
}

impl FromStr for Fingerprint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = base32::decode(BASE32_ALPHABET, &s.to_uppercase())
            .ok_or_else(|| Error::FingerprintParse(format!("invalid base32: {}", s)))?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_canonical_string())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_is_bytewise() {
        let a = Fingerprint::of(b"hello");
        let b = Fingerprint::of(b"hello");
        let c = Fingerprint::of(b"world");
        assert_eq!(a, b);
        assert_ne!(a, c);

        // Same bytes, different codec: not equal
        let raw = Fingerprint::of_with(b"hello", Codec::Raw, HashAlgorithm::Sha2_256);
        let pb = Fingerprint::of_with(b"hello", Codec::DagPb, HashAlgorithm::Sha2_256);
        assert_ne!(raw, pb);
    }

    #[test]
    fn test_string_round_trip() {
        let fp = Fingerprint::of_with(b"round trip", Codec::DagCbor, HashAlgorithm::Sha2_512);
        let s = fp.to_canonical_string();
        let parsed: Fingerprint = s.parse().unwrap();
        assert_eq!(fp, parsed);

        // Canonical form is lowercase and filesystem-safe
        assert_eq!(s, s.to_lowercase());
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_bytes_round_trip() {
        let fp = Fingerprint::of(b"bytes");
        let parsed = Fingerprint::from_bytes(&fp.to_bytes()).unwrap();
        assert_eq!(fp, parsed);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Fingerprint::from_bytes(b"").is_err());
        assert!(Fingerprint::from_bytes(&[9, 0x55, 0x12, 32]).is_err());
        assert!("not!base32!".parse::<Fingerprint>().is_err());
    }

    #[test]
    fn test_digest_lengths() {
        let short = Fingerprint::of_with(b"x", Codec::Raw, HashAlgorithm::Sha2_256);
        let long = Fingerprint::of_with(b"x", Codec::Raw, HashAlgorithm::Sha2_512);
        assert_eq!(short.digest().len(), 32);
        assert_eq!(long.digest().len(), 64);
    }

    #[test]
    fn test_from_parts_validates_length() {
        assert!(Fingerprint::from_parts(Codec::Raw, HashAlgorithm::Sha2_256, vec![0u8; 32]).is_ok());
        assert!(Fingerprint::from_parts(Codec::Raw, HashAlgorithm::Sha2_256, vec![0u8; 16]).is_err());
    }

    #[test]
    fn test_shard_index_stable_and_bounded() {
        let fp = Fingerprint::of(b"shard me");
        assert_eq!(fp.shard_index(64), fp.shard_index(64));
        assert!(fp.shard_index(64) < 64);
        assert!(fp.shard_index(16) < 16);
    }

    #[test]
    fn test_serde_as_string() {
        let fp = Fingerprint::of(b"serde");
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, format!("\"{}\"", fp.to_canonical_string()));
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(fp, back);
    }

    #[test]
    fn test_empty_content_permitted() {
        let fp = Fingerprint::of(b"");
        assert_eq!(fp.digest().len(), 32);
        let s = fp.to_canonical_string();
        assert_eq!(s.parse::<Fingerprint>().unwrap(), fp);
    }
}
