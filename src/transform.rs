/// Content rewriting applied to page bodies on executor threads.
///
/// Implementations are pure: same input, same output, no shared state.
pub trait Transformer: Send + Sync + 'static {
    fn transform(&self, input: &[u8]) -> Vec<u8>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl Transformer for Passthrough {
    fn transform(&self, input: &[u8]) -> Vec<u8> {
        input.to_vec()
    }
}

/// Single-byte XOR mask. Applying it twice with the same key is the identity.
#[derive(Debug, Clone, Copy)]
pub struct XorMask {
    key: u8,
}

impl XorMask {
    pub fn new(key: u8) -> Self {
        Self { key }
    }

    /// Random non-zero key.
    pub fn rotated() -> Self {
        Self::new(rand::Rng::gen_range(&mut rand::thread_rng(), 1..=u8::MAX))
    }

    pub fn key(&self) -> u8 {
        self.key
    }
}

impl Transformer for XorMask {
    fn transform(&self, input: &[u8]) -> Vec<u8> {
        input.iter().map(|b| b ^ self.key).collect()
    }
}
