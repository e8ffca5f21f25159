//! Synchronization Signal ROM Tables
//!
//! Precomputed PSS and SSS reference sequences (3GPP TS 36.211 Section 6.11)
//! at the 1.92 MHz search rate, built once on first use.

use num_complex::Complex64;
use once_cell::sync::Lazy;
use rustfft::FftPlanner;
use std::f64::consts::PI;

/// Nominal LTE sample rate, Hz
pub const FS_LTE: f64 = 30_720_000.0;

/// Search-rate decimation factor relative to [`FS_LTE`]
pub const DECIM: f64 = 16.0;

/// DFT size at the search rate
pub const NFFT: usize = 128;

/// Samples per half-frame at the search rate
pub const HALF_FRAME: usize = 9600;

/// Samples per frame at the search rate
pub const FRAME: usize = 19200;

/// Samples per slot at the search rate
pub const SLOT: usize = 960;

/// PSS time-domain template length: 9-sample cyclic prefix plus one DFT
pub const PSS_TD_LEN: usize = 137;

/// Number of occupied synchronization-signal subcarriers
pub const N_SC_SYNC: usize = 62;

/// Zadoff-Chu root indices for the three PSS sequences
const PSS_ROOTS: [u32; 3] = [25, 29, 34];

fn pss_fd_seq(n_id_2: usize) -> [Complex64; N_SC_SYNC] {
    let u = PSS_ROOTS[n_id_2] as f64;
    let mut d = [Complex64::default(); N_SC_SYNC];
    for (n, v) in d.iter_mut().enumerate() {
        // The DC subcarrier is punctured, so the phase argument skips it.
        let m = if n < 31 { n as f64 } else { (n + 1) as f64 };
        *v = Complex64::from_polar(1.0, -PI * u * m * (m + 1.0) / 63.0);
    }
    d
}

/// Frequency-domain PSS sequences, indexed by sequence identity
pub static PSS_FD: Lazy<[[Complex64; N_SC_SYNC]; 3]> =
    Lazy::new(|| [pss_fd_seq(0), pss_fd_seq(1), pss_fd_seq(2)]);

/// Time-domain PSS templates at the search rate, cyclic prefix included,
/// indexed by sequence identity
pub static PSS_TD: Lazy<[Vec<Complex64>; 3]> = Lazy::new(|| {
    let mut planner = FftPlanner::new();
    let ifft = planner.plan_fft_inverse(NFFT);
    let build = |n_id_2: usize| {
        let fd = &PSS_FD[n_id_2];
        let mut bins = vec![Complex64::default(); NFFT];
        // Positive frequencies in bins 1..=31, negative in 97..=127.
        for i in 0..31 {
            bins[97 + i] = fd[i];
            bins[1 + i] = fd[31 + i];
        }
        ifft.process(&mut bins);
        let mut td = Vec::with_capacity(PSS_TD_LEN);
        td.extend_from_slice(&bins[NFFT - 9..]);
        td.extend_from_slice(&bins);
        // Normalize to unit average sample power; the detection threshold
        // in the correlator assumes this scaling.
        let pow: f64 = td.iter().map(|v| v.norm_sqr()).sum::<f64>() / PSS_TD_LEN as f64;
        let scale = 1.0 / pow.sqrt();
        for v in td.iter_mut() {
            *v *= scale;
        }
        td
    };
    [build(0), build(1), build(2)]
});

fn m_sequence(taps: &[usize]) -> [f64; 31] {
    let mut x = [0u8; 31];
    x[4] = 1;
    for i in 0..26 {
        let mut next = 0u8;
        for &t in taps {
            next ^= x[i + t];
        }
        x[i + 5] = next;
    }
    let mut s = [0.0; 31];
    for (i, v) in s.iter_mut().enumerate() {
        *v = 1.0 - 2.0 * x[i] as f64;
    }
    s
}

fn sss_fd_seq(n_id_1: usize, n_id_2: usize, subframe_5: bool) -> [f64; N_SC_SYNC] {
    // m0/m1 derivation per TS 36.211 Table 6.11.2.1-1.
    let q_prime = n_id_1 / 30;
    let q = (n_id_1 + q_prime * (q_prime + 1) / 2) / 30;
    let m_prime = n_id_1 + q * (q + 1) / 2;
    let m0 = m_prime % 31;
    let m1 = (m0 + m_prime / 31 + 1) % 31;

    let s_tilde = m_sequence(&[0, 2]);
    let c_tilde = m_sequence(&[0, 3]);
    let z_tilde = m_sequence(&[0, 1, 2, 4]);

    let s0 = |n: usize| s_tilde[(n + m0) % 31];
    let s1 = |n: usize| s_tilde[(n + m1) % 31];
    let c0 = |n: usize| c_tilde[(n + n_id_2) % 31];
    let c1 = |n: usize| c_tilde[(n + n_id_2 + 3) % 31];
    let z1_m0 = |n: usize| z_tilde[(n + m0 % 8) % 31];
    let z1_m1 = |n: usize| z_tilde[(n + m1 % 8) % 31];

    let mut d = [0.0; N_SC_SYNC];
    for n in 0..31 {
        if subframe_5 {
            d[2 * n] = s1(n) * c0(n);
            d[2 * n + 1] = s0(n) * c1(n) * z1_m1(n);
        } else {
            d[2 * n] = s0(n) * c0(n);
            d[2 * n + 1] = s1(n) * c1(n) * z1_m0(n);
        }
    }
    d
}

/// SSS sequences for all 168 group identities, 3 sequence identities and
/// both half-frame positions. Indexed `[n_id_1][n_id_2][half]` where
/// `half` is 0 for subframe 0 and 1 for subframe 5.
pub static SSS_FD: Lazy<Vec<[[[f64; N_SC_SYNC]; 2]; 3]>> = Lazy::new(|| {
    (0..168)
        .map(|g| {
            let per_seq = |s: usize| [sss_fd_seq(g, s, false), sss_fd_seq(g, s, true)];
            [per_seq(0), per_seq(1), per_seq(2)]
        })
        .collect()
});
