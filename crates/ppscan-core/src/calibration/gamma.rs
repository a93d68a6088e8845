//! Per-channel output gamma tables.

/// Exponent of the built-in curve.
pub const DEFAULT_GAMMA: f64 = 1.8;

/// Three 256-entry lookup tables, R, G, B.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GammaTables([[u8; 256]; 3]);

impl Default for GammaTables {
    fn default() -> Self {
        Self::with_exponent(DEFAULT_GAMMA)
    }
}

impl GammaTables {
    pub fn with_exponent(gamma: f64) -> Self {
        let mut table = [0u8; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            *entry = (255.0 * (i as f64 / 255.0).powf(1.0 / gamma)).round() as u8;
        }
        Self([table; 3])
    }

    pub fn identity() -> Self {
        let mut table = [0u8; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            *entry = i as u8;
        }
        Self([table; 3])
    }

    pub fn channel(&self, channel: usize) -> &[u8; 256] {
        &self.0[channel]
    }

    pub fn set(&mut self, channel: usize, table: [u8; 256]) {
        self.0[channel] = table;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Upload order: R, G, B.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.concat()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_curve_endpoints() {
        let gamma = GammaTables::default();
        let table = gamma.channel(0);
        assert_eq!(table[0], 0);
        assert_eq!(table[255], 255);
        assert!(table[64] > 64);
        assert!(table.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_set_and_reset() {
        let mut gamma = GammaTables::identity();
        gamma.set(2, [7; 256]);
        let bytes = gamma.to_bytes();
        assert_eq!(bytes.len(), 768);
        assert_eq!(bytes[300], 44);
        assert_eq!(bytes[600], 7);
        gamma.reset();
        assert_eq!(gamma, GammaTables::default());
    }
}
