//! Deterministic 128-bit content hashing
//!
//! The value model needs a content hash that is stable across processes and
//! platforms (composed-wire caches and set membership both key on it), so
//! the std `Hasher` machinery with its per-process seeding is not enough.
//! `Hash128` wraps a blake3 hasher and truncates the digest to 128 bits.
//!
//! Callers follow one discipline: feed a discriminant byte before the
//! payload of whatever they are hashing, so `Int(0)` and `Float(0.0)` can
//! never collide structurally.

/// Streaming 128-bit content hasher.
#[derive(Default)]
pub struct Hash128 {
    inner: blake3::Hasher,
}

impl Hash128 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a type discriminant. Always call this before the payload.
    pub fn update_tag(&mut self, tag: u8) {
        self.inner.update(&[tag]);
    }

    pub fn update_bytes(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    pub fn update_u8(&mut self, v: u8) {
        self.inner.update(&[v]);
    }

    pub fn update_u32(&mut self, v: u32) {
        self.inner.update(&v.to_le_bytes());
    }

    pub fn update_u64(&mut self, v: u64) {
        self.inner.update(&v.to_le_bytes());
    }

    pub fn update_i64(&mut self, v: i64) {
        self.inner.update(&v.to_le_bytes());
    }

    /// Floats hash by IEEE bit pattern.
    pub fn update_f64(&mut self, v: f64) {
        self.update_u64(v.to_bits());
    }

    /// Fold another 128-bit hash into this one. Used for order-insensitive
    /// container hashing: hash each element separately, sort, then fold.
    pub fn update_hash(&mut self, h: u128) {
        self.inner.update(&h.to_le_bytes());
    }

    /// First 16 bytes of the blake3 digest, little-endian.
    pub fn finish128(&self) -> u128 {
        let digest = self.inner.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest.as_bytes()[..16]);
        u128::from_le_bytes(bytes)
    }
}

/// One-shot convenience for hashing a byte span.
pub fn hash128_bytes(bytes: &[u8]) -> u128 {
    let mut h = Hash128::new();
    h.update_bytes(bytes);
    h.finish128()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        let mut a = Hash128::new();
        a.update_tag(5);
        a.update_i64(42);
        let mut b = Hash128::new();
        b.update_tag(5);
        b.update_i64(42);
        assert_eq!(a.finish128(), b.finish128());
    }

    #[test]
    fn test_tag_separates_payloads() {
        // same payload bytes, different discriminant
        let mut a = Hash128::new();
        a.update_tag(4);
        a.update_u64(0);
        let mut b = Hash128::new();
        b.update_tag(11);
        b.update_u64(0);
        assert_ne!(a.finish128(), b.finish128());
    }

    #[test]
    fn test_float_bits() {
        let mut a = Hash128::new();
        a.update_f64(0.0);
        let mut b = Hash128::new();
        b.update_f64(-0.0);
        // 0.0 and -0.0 have different bit patterns on purpose
        assert_ne!(a.finish128(), b.finish128());
    }

    #[test]
    fn test_fold_is_order_sensitive() {
        let x = hash128_bytes(b"x");
        let y = hash128_bytes(b"y");
        let mut a = Hash128::new();
        a.update_hash(x);
        a.update_hash(y);
        let mut b = Hash128::new();
        b.update_hash(y);
        b.update_hash(x);
        assert_ne!(a.finish128(), b.finish128());
    }

    #[test]
    fn test_one_shot_matches_streaming() {
        let mut h = Hash128::new();
        h.update_bytes(b"hello weft");
        assert_eq!(h.finish128(), hash128_bytes(b"hello weft"));
    }
}
