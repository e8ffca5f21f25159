//! Common Utilities
//!
//! Small DSP and bit-manipulation helpers shared across the workspace.

use num_complex::Complex64;

/// Convert a linear power ratio to decibels
pub fn to_db(x: f64) -> f64 {
    10.0 * x.log10()
}

/// Convert decibels to a linear power ratio
pub fn from_db(db: f64) -> f64 {
    10.0_f64.powf(db / 10.0)
}

/// Average power of a complex signal
pub fn sigpower(x: &[Complex64]) -> f64 {
    if x.is_empty() {
        return 0.0;
    }
    x.iter().map(|v| v.norm_sqr()).sum::<f64>() / x.len() as f64
}

/// Wrap `x` into the half-open interval `[lo, hi)`
pub fn wrap(x: f64, lo: f64, hi: f64) -> f64 {
    let span = hi - lo;
    let mut y = (x - lo) % span;
    if y < 0.0 {
        y += span;
    }
    y + lo
}

/// Positive remainder of `x` modulo `m`, usable as an array index
pub fn mod_pos(x: i64, m: i64) -> usize {
    (((x % m) + m) % m) as usize
}

/// Inverse CDF of the chi-square distribution via the Wilson-Hilferty
/// approximation. `z` is the standard-normal quantile of the target
/// probability and `dof` the degrees of freedom. Accurate to a few percent
/// for the far-tail quantiles used in detection thresholds.
pub fn chi2_inv(z: f64, dof: f64) -> f64 {
    let a = 2.0 / (9.0 * dof);
    dof * (1.0 - a + z * a.sqrt()).powi(3)
}

/// CRC-16 with generator polynomial D^16 + D^12 + D^5 + 1, computed over a
/// bit slice (one bit per element, MSB first).
pub fn crc16(bits: &[u8]) -> u16 {
    let mut reg: u32 = 0;
    for &bit in bits {
        let fb = ((reg >> 15) & 1) as u8 ^ (bit & 1);
        reg = (reg << 1) & 0xffff;
        if fb == 1 {
            reg ^= 0x1021;
        }
    }
    reg as u16
}

/// Unpack an integer into `n` bits, MSB first
pub fn unpack_bits(value: u32, n: usize) -> Vec<u8> {
    (0..n).map(|i| ((value >> (n - 1 - i)) & 1) as u8).collect()
}

/// Pack an MSB-first bit slice into an integer
pub fn pack_bits(bits: &[u8]) -> u32 {
    bits.iter().fold(0, |acc, &b| (acc << 1) | b as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_roundtrip() {
        assert!((to_db(100.0) - 20.0).abs() < 1e-12);
        assert!((from_db(3.0) - 1.9952623149688795).abs() < 1e-12);
    }

    #[test]
    fn test_sigpower() {
        let x = vec![Complex64::new(1.0, 0.0), Complex64::new(0.0, 2.0)];
        assert!((sigpower(&x) - 2.5).abs() < 1e-12);
        assert_eq!(sigpower(&[]), 0.0);
    }

    #[test]
    fn test_wrap() {
        assert!((wrap(10.5, -0.5, 9.5) - 0.5).abs() < 1e-12);
        assert!((wrap(-1.0, -0.5, 9.5) - 9.0).abs() < 1e-12);
        assert!((wrap(3.0, -0.5, 9.5) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_mod_pos() {
        assert_eq!(mod_pos(-1, 9600), 9599);
        assert_eq!(mod_pos(9601, 9600), 1);
    }

    #[test]
    fn test_chi2_inv_matches_table() {
        // chi2inv(0.999999, 2) is about 27.6; Wilson-Hilferty lands within
        // a few percent, which is enough for a detection threshold.
        let z = 4.7534; // standard normal quantile of 1 - 1e-6
        let v = chi2_inv(z, 2.0);
        assert!(v > 24.0 && v < 31.0, "chi2_inv(2 dof) = {v}");
    }

    #[test]
    fn test_crc16_known_vector() {
        // All-zero payload leaves the register at zero.
        assert_eq!(crc16(&[0; 24]), 0);
        // A single leading one exercises the full polynomial shift.
        let mut bits = vec![0u8; 24];
        bits[0] = 1;
        assert_ne!(crc16(&bits), 0);
    }

    #[test]
    fn test_pack_unpack() {
        let bits = unpack_bits(0b101101, 6);
        assert_eq!(bits, vec![1, 0, 1, 1, 0, 1]);
        assert_eq!(pack_bits(&bits), 0b101101);
    }
}
