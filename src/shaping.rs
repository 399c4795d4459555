//! Traffic shaping for opt-in sends: every frame is padded to a randomized
//! target size and sent after a small random delay.

use std::time::Duration;

use rand::{Rng, RngCore};

pub const BASE_TARGET: usize = 1200;
pub const TARGET_SPREAD: usize = 200;
pub const MAX_JITTER_MS: u64 = 5;

/// `len (u32 BE) || payload || random fill`, at least `1200 + U[0,200)` bytes.
pub fn frame<R: RngCore>(payload: &[u8], rng: &mut R) -> Vec<u8> {
    let target = BASE_TARGET + rng.gen_range(0..TARGET_SPREAD);
    let mut out = Vec::with_capacity((4 + payload.len()).max(target));
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    if out.len() < target {
        let mut fill = vec![0u8; target - out.len()];
        rng.fill_bytes(&mut fill);
        out.extend_from_slice(&fill);
    }
    out
}

/// Payload of a shaped frame, `None` if the length prefix overruns it.
pub fn unframe(frame: &[u8]) -> Option<&[u8]> {
    let len = u32::from_be_bytes(frame.get(..4)?.try_into().ok()?) as usize;
    frame.get(4..4 + len)
}

pub fn jitter<R: RngCore>(rng: &mut R) -> Duration {
    Duration::from_millis(rng.gen_range(0..MAX_JITTER_MS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn small_payload_padded_into_target_window() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let f = frame(b"hello", &mut rng);
            assert!(f.len() >= BASE_TARGET && f.len() < BASE_TARGET + TARGET_SPREAD);
            assert_eq!(unframe(&f), Some(&b"hello"[..]));
        }
    }

    #[test]
    fn large_payload_is_not_truncated() {
        let mut rng = StdRng::seed_from_u64(1);
        let big = vec![9u8; 4000];
        let f = frame(&big, &mut rng);
        assert_eq!(f.len(), 4004);
        assert_eq!(unframe(&f).unwrap().len(), 4000);
    }

    #[test]
    fn jitter_stays_under_five_ms() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            assert!(jitter(&mut rng) < Duration::from_millis(MAX_JITTER_MS));
        }
    }
}
