/// The key every outgoing frame is masked with under [`MaskKey::Fixed`].
pub const FIXED_MASK: [u8; 4] = [0x1, 0x2, 0x3, 0x4];

/// How outgoing frames choose their masking key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaskKey {
    /// Always use [`FIXED_MASK`].
    ///
    /// Matches peers that were tested against the literal `1, 2, 3, 4` key. RFC 6455
    /// asks for an unpredictable key per frame, which only [`MaskKey::Random`] provides.
    #[default]
    Fixed,
    /// Draw a fresh random key for every frame.
    Random,
}

impl MaskKey {
    /// The key to mask the next frame with.
    #[inline]
    pub fn next_key(self) -> [u8; 4] {
        match self {
            MaskKey::Fixed => FIXED_MASK,
            MaskKey::Random => generate_mask(),
        }
    }
}

/// Generate a random frame mask.
#[inline]
pub fn generate_mask() -> [u8; 4] {
    rand::random()
}

/// Mask/unmask a frame.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    apply_mask_fast32(buf, mask)
}

/// A safe unoptimized mask application.
#[inline]
fn apply_mask_fallback(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Faster version of `apply_mask()` which operates on 4-byte blocks.
#[inline]
fn apply_mask_fast32(buf: &mut [u8], mask: [u8; 4]) {
    let mut chunks = buf.chunks_exact_mut(4);
    for chunk in &mut chunks {
        for (byte, key) in chunk.iter_mut().zip(mask) {
            *byte ^= key;
        }
    }
    // The remainder starts on a 4-byte boundary, so the key index restarts at 0.
    apply_mask_fallback(chunks.into_remainder(), mask);
}
