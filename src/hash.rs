//! FNV-1a/32 name hashing, used to correlate owned pods/services/PVCs with
//! the sandbox, pool, or template that produced them.
//!
//! The hash is a correlation hint, not an authorization token: collisions
//! within a namespace are possible though rare.

const FNV_OFFSET_BASIS: u32 = 0x811c9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a over the UTF-8 bytes of `name`.
fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// 8-character lowercase zero-padded hex rendering of `fnv1a32(name)`.
pub fn name_hash(name: &str) -> String {
    format!("{:08x}", fnv1a32(name.as_bytes()))
}
