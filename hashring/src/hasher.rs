//! Key hash functions.
//!
//! Every hasher reduces a key to a `u32` the same way libmemcached does, so
//! a pool shared with other libmemcached-based clients routes keys to the same
//! servers. 64-bit variants keep the low 32 bits.

use crate::md5::md5;

/// Hashes keys (and ring point labels) to 32-bit positions.
pub trait Hasher: Send + Sync {
    fn hash(&self, key: &[u8]) -> u32;

    /// Ring positions for the `count` points owned by `identity`.
    ///
    /// The default places one point per `hash("<identity>-<i>")`.
    fn points(&self, identity: &str, count: usize) -> Vec<u32> {
        (0..count)
            .map(|i| self.hash(format!("{identity}-{i}").as_bytes()))
            .collect()
    }
}

/// The hash functions a client can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashKind {
    /// Jenkins one-at-a-time.
    #[default]
    OneAtATime,
    Md5,
    Crc32,
    Fnv1_64,
    Fnv1a64,
    Fnv1_32,
    Fnv1a32,
    Hsieh,
    Murmur,
}

impl HashKind {
    /// Build the hasher for this kind.
    pub fn hasher(self) -> Box<dyn Hasher> {
        match self {
            HashKind::OneAtATime => Box::new(OneAtATime),
            HashKind::Md5 => Box::new(Md5),
            HashKind::Crc32 => Box::new(Crc32),
            HashKind::Fnv1_64 => Box::new(Fnv1_64),
            HashKind::Fnv1a64 => Box::new(Fnv1a64),
            HashKind::Fnv1_32 => Box::new(Fnv1_32),
            HashKind::Fnv1a32 => Box::new(Fnv1a32),
            HashKind::Hsieh => Box::new(Hsieh),
            HashKind::Murmur => Box::new(Murmur),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HashKind::OneAtATime => "one_at_a_time",
            HashKind::Md5 => "md5",
            HashKind::Crc32 => "crc32",
            HashKind::Fnv1_64 => "fnv1_64",
            HashKind::Fnv1a64 => "fnv1a_64",
            HashKind::Fnv1_32 => "fnv1_32",
            HashKind::Fnv1a32 => "fnv1a_32",
            HashKind::Hsieh => "hsieh",
            HashKind::Murmur => "murmur",
        }
    }
}

// -- MD5 ---------------------------------------------------------------------

/// First four digest bytes, little-endian.
///
/// Ring points follow libketama: each digest of `"<identity>-<i>"` yields
/// four points, so `count` points need `count / 4` digests.
#[derive(Debug, Clone, Copy, Default)]
pub struct Md5;

impl Hasher for Md5 {
    #[inline]
    fn hash(&self, key: &[u8]) -> u32 {
        let digest = md5(key);
        u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
    }

    fn points(&self, identity: &str, count: usize) -> Vec<u32> {
        let mut points = Vec::with_capacity(count);
        for i in 0..count / 4 {
            let digest = md5(format!("{identity}-{i}").as_bytes());
            points.extend(
                digest
                    .chunks_exact(4)
                    .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]])),
            );
        }
        points
    }
}

// -- CRC32 -------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct Crc32;

impl Hasher for Crc32 {
    #[inline]
    fn hash(&self, key: &[u8]) -> u32 {
        crc32fast::hash(key)
    }
}

// -- FNV ---------------------------------------------------------------------

const FNV_32_OFFSET: u32 = 0x811c9dc5;
const FNV_32_PRIME: u32 = 0x0100_0193;
const FNV_64_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_64_PRIME: u64 = 0x0000_0100_0000_01b3;

#[derive(Debug, Clone, Copy, Default)]
pub struct Fnv1_32;

impl Hasher for Fnv1_32 {
    fn hash(&self, key: &[u8]) -> u32 {
        key.iter().fold(FNV_32_OFFSET, |h, &b| {
            h.wrapping_mul(FNV_32_PRIME) ^ u32::from(b)
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Fnv1a32;

impl Hasher for Fnv1a32 {
    fn hash(&self, key: &[u8]) -> u32 {
        key.iter().fold(FNV_32_OFFSET, |h, &b| {
            (h ^ u32::from(b)).wrapping_mul(FNV_32_PRIME)
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Fnv1_64;

impl Hasher for Fnv1_64 {
    fn hash(&self, key: &[u8]) -> u32 {
        key.iter().fold(FNV_64_OFFSET, |h, &b| {
            h.wrapping_mul(FNV_64_PRIME) ^ u64::from(b)
        }) as u32
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Fnv1a64;

impl Hasher for Fnv1a64 {
    fn hash(&self, key: &[u8]) -> u32 {
        key.iter().fold(FNV_64_OFFSET, |h, &b| {
            (h ^ u64::from(b)).wrapping_mul(FNV_64_PRIME)
        }) as u32
    }
}

// -- Jenkins one-at-a-time ---------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct OneAtATime;

impl Hasher for OneAtATime {
    fn hash(&self, key: &[u8]) -> u32 {
        let mut h: u32 = 0;
        for &b in key {
            h = h.wrapping_add(u32::from(b));
            h = h.wrapping_add(h << 10);
            h ^= h >> 6;
        }
        h = h.wrapping_add(h << 3);
        h ^= h >> 11;
        h.wrapping_add(h << 15)
    }
}

// -- Hsieh SuperFastHash -----------------------------------------------------

/// Paul Hsieh's SuperFastHash, seeded with zero as libmemcached does.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hsieh;

impl Hasher for Hsieh {
    fn hash(&self, key: &[u8]) -> u32 {
        if key.is_empty() {
            return 0;
        }

        let get16 = |b: &[u8]| u32::from(u16::from_le_bytes([b[0], b[1]]));
        let mut h: u32 = 0;

        let mut blocks = key.chunks_exact(4);
        for block in &mut blocks {
            h = h.wrapping_add(get16(&block[0..2]));
            let tmp = (get16(&block[2..4]) << 11) ^ h;
            h = (h << 16) ^ tmp;
            h = h.wrapping_add(h >> 11);
        }

        let rest = blocks.remainder();
        match rest.len() {
            3 => {
                h = h.wrapping_add(get16(rest));
                h ^= h << 16;
                // The third byte is sign-extended (signed char in the C source).
                h ^= (rest[2] as i8 as i32 as u32) << 18;
                h = h.wrapping_add(h >> 11);
            }
            2 => {
                h = h.wrapping_add(get16(rest));
                h ^= h << 11;
                h = h.wrapping_add(h >> 17);
            }
            1 => {
                h = h.wrapping_add(u32::from(rest[0]));
                h ^= h << 10;
                h = h.wrapping_add(h >> 1);
            }
            _ => {}
        }

        h ^= h << 3;
        h = h.wrapping_add(h >> 5);
        h ^= h << 4;
        h = h.wrapping_add(h >> 17);
        h ^= h << 25;
        h.wrapping_add(h >> 6)
    }
}

// -- Murmur2 -----------------------------------------------------------------

/// MurmurHash2 with libmemcached's length-dependent seed.
#[derive(Debug, Clone, Copy, Default)]
pub struct Murmur;

impl Hasher for Murmur {
    fn hash(&self, key: &[u8]) -> u32 {
        const M: u32 = 0x5bd1_e995;
        const R: u32 = 24;

        let len = key.len() as u32;
        let seed = 0xdead_beef_u32.wrapping_mul(len);
        let mut h = seed ^ len;

        let mut blocks = key.chunks_exact(4);
        for block in &mut blocks {
            let mut k = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
            k = k.wrapping_mul(M);
            k ^= k >> R;
            k = k.wrapping_mul(M);
            h = h.wrapping_mul(M);
            h ^= k;
        }

        let rest = blocks.remainder();
        if rest.len() >= 3 {
            h ^= u32::from(rest[2]) << 16;
        }
        if rest.len() >= 2 {
            h ^= u32::from(rest[1]) << 8;
        }
        if let Some(&first) = rest.first() {
            h ^= u32::from(first);
            h = h.wrapping_mul(M);
        }

        h ^= h >> 13;
        h = h.wrapping_mul(M);
        h ^ (h >> 15)
    }
}
