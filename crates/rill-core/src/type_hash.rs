//! Structural type identity.
//!
//! [`TypeHash`] is a 64-bit XXHash64 digest of a type's *shape*: its kind tag,
//! its name where the name carries identity (classes, enums, type parameters,
//! parameter names), and the hashes of its component types in order. Two types
//! with the same shape always hash equal, which is what lets the type table
//! intern them and lets the specialization cache key on argument signatures.
//!
//! ## Hash Computation
//!
//! Each component is folded in with a position marker and a non-commutative
//! multiply, so `map<int,string>` and `map<string,int>` never collide.

use std::fmt;
use xxhash_rust::xxh64::xxh64;

/// Mixing constants keeping the hash domains apart.
pub mod hash_constants {
    /// Multiplier used between folded components.
    pub const SEP: u64 = 0x4bc94d6bd06053ad;

    /// Domain marker for type shapes.
    pub const SHAPE: u64 = 0x2fac10b63a6cc57c;

    /// Domain marker for routine identities.
    pub const ROUTINE: u64 = 0x5ea77ffbcdf5f302;

    /// Domain marker for argument signatures.
    pub const SIGNATURE: u64 = 0x7d3c8b4a92e15f6d;

    /// Per-position markers; positions past the table derive from the first.
    pub const POSITION_MARKERS: [u64; 8] = [
        0x9e3779b97f4a7c15,
        0xbf58476d1ce4e5b9,
        0x94d049bb133111eb,
        0xd6e8feb86659fd93,
        0xe7037ed1a0b428db,
        0xc6a4a7935bd1e995,
        0x8648dbbc94d49b8d,
        0xa2b48b2c69e0d657,
    ];
}

/// A deterministic hash identifying a type shape or routine identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct TypeHash(pub u64);

#[inline]
fn position_marker(i: usize) -> u64 {
    hash_constants::POSITION_MARKERS
        .get(i)
        .copied()
        .unwrap_or_else(|| hash_constants::POSITION_MARKERS[0].wrapping_add(i as u64))
}

#[inline]
fn fold(seed: u64, parts: &[TypeHash]) -> u64 {
    parts.iter().enumerate().fold(seed, |hash, (i, part)| {
        hash.wrapping_mul(hash_constants::SEP)
            .wrapping_add(position_marker(i) ^ part.0)
    })
}

impl TypeHash {
    pub const EMPTY: TypeHash = TypeHash(0);

    /// Hash of a type shape: kind tag, identifying name, components.
    pub fn from_shape(tag: u8, name: &str, components: &[TypeHash]) -> Self {
        let seed = hash_constants::SHAPE ^ xxh64(name.as_bytes(), tag as u64);
        TypeHash(fold(seed, components))
    }

    /// Identity of a routine: its qualified name plus parameter shapes.
    pub fn from_routine(name: &str, params: &[TypeHash]) -> Self {
        let seed = hash_constants::ROUTINE ^ xxh64(name.as_bytes(), 0);
        TypeHash(fold(seed, params))
    }

    /// Key for a list of argument types, used by call-site caches.
    pub fn from_signature(args: &[TypeHash]) -> Self {
        TypeHash(fold(hash_constants::SIGNATURE, args))
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for TypeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeHash(0x{:016x})", self.0)
    }
}

impl fmt::Display for TypeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
