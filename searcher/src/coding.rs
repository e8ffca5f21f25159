//! Channel Coding Primitives
//!
//! The broadcast channel coding chain per 3GPP TS 36.212: tail-biting
//! convolutional coding, sub-block interleaving with circular-buffer rate
//! matching, Gold-sequence scrambling and QPSK. Both directions are
//! implemented; the transmit direction feeds the signal synthesis used in
//! tests.

use num_complex::Complex64;
use std::f64::consts::FRAC_1_SQRT_2;

/// Gold sequence initialization discard length (TS 36.211 7.2)
const NC: usize = 1600;

/// Constraint-length-7 generator polynomials 133/171/165 octal, current
/// input bit in the MSB position.
const GEN: [u32; 3] = [0o133, 0o171, 0o165];

/// Sub-block interleaver column permutation (TS 36.212 Table 5.1.4-2)
const COL_PERM: [usize; 32] = [
    1, 17, 9, 25, 5, 21, 13, 29, 3, 19, 11, 27, 7, 23, 15, 31, 0, 16, 8, 24, 4, 20, 12, 28, 2, 18,
    10, 26, 6, 22, 14, 30,
];

/// Length-31 Gold pseudo-random sequence with the given initialization
pub fn pn_sequence(c_init: u32, len: usize) -> Vec<u8> {
    let total = NC + len;
    let mut x1 = vec![0u8; total + 31];
    let mut x2 = vec![0u8; total + 31];
    x1[0] = 1;
    for i in 0..31 {
        x2[i] = ((c_init >> i) & 1) as u8;
    }
    for i in 0..total {
        x1[i + 31] = x1[i + 3] ^ x1[i];
        x2[i + 31] = x2[i + 3] ^ x2[i + 2] ^ x2[i + 1] ^ x2[i];
    }
    (0..len).map(|i| x1[NC + i] ^ x2[NC + i]).collect()
}

/// QPSK-modulate a bit slice (length must be even)
pub fn qpsk_modulate(bits: &[u8]) -> Vec<Complex64> {
    bits.chunks_exact(2)
        .map(|b| {
            Complex64::new(
                FRAC_1_SQRT_2 * (1.0 - 2.0 * b[0] as f64),
                FRAC_1_SQRT_2 * (1.0 - 2.0 * b[1] as f64),
            )
        })
        .collect()
}

/// Soft-demodulate QPSK symbols into log-likelihood ratios, positive
/// meaning bit 0. `np` is the per-symbol noise power estimate.
pub fn qpsk_demodulate(syms: &[Complex64], np: &[f64]) -> Vec<f64> {
    let mut soft = Vec::with_capacity(2 * syms.len());
    for (s, &n) in syms.iter().zip(np.iter()) {
        let scale = 2.0 * std::f64::consts::SQRT_2 / n.max(1e-300);
        soft.push(scale * s.re);
        soft.push(scale * s.im);
    }
    soft
}

fn conv_outputs(reg: u32) -> [u8; 3] {
    let mut out = [0u8; 3];
    for (i, &g) in GEN.iter().enumerate() {
        out[i] = ((reg & g).count_ones() & 1) as u8;
    }
    out
}

/// Rate-1/3 tail-biting convolutional encoder; the shift register starts
/// loaded with the message tail so the trellis wraps around.
pub fn conv_encode(bits: &[u8]) -> [Vec<u8>; 3] {
    let d = bits.len();
    let mut state: u32 = 0;
    for i in 0..6 {
        state |= (bits[d - 1 - i] as u32) << (5 - i);
    }
    let mut streams = [
        Vec::with_capacity(d),
        Vec::with_capacity(d),
        Vec::with_capacity(d),
    ];
    for &b in bits {
        let reg = ((b as u32) << 6) | state;
        let out = conv_outputs(reg);
        for i in 0..3 {
            streams[i].push(out[i]);
        }
        state = reg >> 1;
    }
    streams
}

/// Wrap-around Viterbi decoder for the tail-biting code.
///
/// `soft` holds one `[f64; 3]` of code-bit log-likelihoods per message bit.
/// The trellis is run over three concatenated copies and the middle copy is
/// kept, which resolves the unknown start state without an explicit
/// state search.
pub fn conv_decode(soft: &[[f64; 3]]) -> Vec<u8> {
    let d = soft.len();
    let n_stages = 3 * d;
    let n_states = 64usize;

    let mut metric = vec![0.0f64; n_states];
    let mut next_metric = vec![0.0f64; n_states];
    let mut survivor = vec![0u8; n_stages * n_states];

    for t in 0..n_stages {
        let s = &soft[t % d];
        for m in next_metric.iter_mut() {
            *m = f64::NEG_INFINITY;
        }
        for state in 0..n_states {
            for b in 0..2u32 {
                let reg = (b << 6) | state as u32;
                let out = conv_outputs(reg);
                let bm: f64 = (0..3)
                    .map(|i| (1.0 - 2.0 * out[i] as f64) * s[i])
                    .sum();
                let next = (reg >> 1) as usize;
                let cand = metric[state] + bm;
                if cand > next_metric[next] {
                    next_metric[next] = cand;
                    // Survivor records which prior-state LSB fed this state;
                    // the input bit is the next state's MSB.
                    survivor[t * n_states + next] = (state & 1) as u8;
                }
            }
        }
        std::mem::swap(&mut metric, &mut next_metric);
    }

    let mut best = 0;
    for s in 1..n_states {
        if metric[s] > metric[best] {
            best = s;
        }
    }

    let mut decoded = vec![0u8; n_stages];
    let mut state = best;
    for t in (0..n_stages).rev() {
        decoded[t] = ((state >> 5) & 1) as u8;
        let lsb = survivor[t * n_states + state] as usize;
        state = ((state << 1) & 0x3f) | lsb;
    }
    decoded[d..2 * d].to_vec()
}

/// Sub-block interleave one stream; `None` entries are the dummy padding
/// the rate matcher skips.
fn sub_block_interleave(stream: &[u8]) -> Vec<Option<u8>> {
    let d = stream.len();
    let rows = d.div_ceil(32);
    let k_pi = rows * 32;
    let n_dummy = k_pi - d;
    let mut mat = vec![None; k_pi];
    for (i, slot) in mat.iter_mut().enumerate().skip(n_dummy) {
        *slot = Some(stream[i - n_dummy]);
    }
    let mut out = Vec::with_capacity(k_pi);
    for &col in COL_PERM.iter() {
        for row in 0..rows {
            out.push(mat[row * 32 + col]);
        }
    }
    out
}

/// Positions (stream, bit index) of the circular buffer entries in
/// transmission order, dummies excluded.
fn circular_buffer_positions(d: usize) -> Vec<(usize, usize)> {
    let rows = d.div_ceil(32);
    let k_pi = rows * 32;
    let n_dummy = k_pi - d;
    let mut positions = Vec::with_capacity(3 * d);
    for stream in 0..3 {
        for &col in COL_PERM.iter() {
            for row in 0..rows {
                let src = row * 32 + col;
                if src >= n_dummy {
                    positions.push((stream, src - n_dummy));
                }
            }
        }
    }
    positions
}

/// Rate-match the three encoded streams to `e_len` output bits
pub fn rate_match(streams: &[Vec<u8>; 3], e_len: usize) -> Vec<u8> {
    let d = streams[0].len();
    let positions = circular_buffer_positions(d);
    (0..e_len)
        .map(|j| {
            let (s, i) = positions[j % positions.len()];
            streams[s][i]
        })
        .collect()
}

/// Invert rate matching: fold `e_len` soft bits back onto the circular
/// buffer, summing repetitions, and return soft code-bit triples.
pub fn rate_unmatch(soft: &[f64], d: usize) -> Vec<[f64; 3]> {
    let positions = circular_buffer_positions(d);
    let mut acc = vec![[0.0f64; 3]; d];
    for (j, &v) in soft.iter().enumerate() {
        let (s, i) = positions[j % positions.len()];
        acc[i][s] += v;
    }
    acc
}
