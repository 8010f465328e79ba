use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use rand::rngs::OsRng;
use rand::RngCore;

static COUNTER: AtomicU64 = AtomicU64::new(0);
static SEED: OnceLock<[u8; 16]> = OnceLock::new();

const DIGITS: &[u8; 16] = b"0123456789abcdef";

fn seed() -> &'static [u8; 16] {
    SEED.get_or_init(|| {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        bytes
    })
}

/// Returns a process-unique id in canonical 8-4-4-4-12 form.
///
/// The 16 payload bytes are the per-process random seed XOR'd with an
/// incrementing counter written little-endian into the low half. Each byte
/// is emitted low nibble first. Cheap enough for one id per proxied request.
pub fn new_uuid() -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
    let mut id = *seed();
    for (i, b) in n.to_le_bytes().iter().enumerate() {
        id[i % 16] ^= b;
    }

    let mut out = Vec::with_capacity(36);
    let mut next = 0;
    let mut write = |count: usize, out: &mut Vec<u8>| {
        if !out.is_empty() {
            out.push(b'-');
        }
        for _ in 0..count {
            let x = id[next] as usize;
            out.push(DIGITS[x % 16]);
            out.push(DIGITS[x / 16]);
            next += 1;
        }
    };

    write(4, &mut out);
    write(2, &mut out);
    write(2, &mut out);
    write(2, &mut out);
    write(6, &mut out);

    // Only ASCII hex and dashes were pushed.
    String::from_utf8(out).expect("ascii uuid")
}

pub fn new_uuids(n: usize) -> Vec<String> {
    (0..n).map(|_| new_uuid()).collect()
}
