//! PSS Correlation and Peak Detection
//!
//! Correlates the capture against the three known primary synchronization
//! sequences over a grid of frequency-offset hypotheses, combines the
//! correlation power incoherently across half-frame repetitions, and
//! extracts mutually exclusive correlation peaks as cell candidates.
//!
//! Correlations at different repetitions can only be combined incoherently
//! since consecutive sync transmissions may come from different antennas.
//! The half-frame period in samples stretches with the frequency offset,
//! so repetition start indices are rescaled by the sampling correction
//! factor before combining.

use crate::constants::{FS_LTE, HALF_FRAME, PSS_TD, PSS_TD_LEN};
use crate::{SearchConfig, SearchError};
use capture::CaptureBuffer;
use common::types::CellCandidate;
use common::utils::{chi2_inv, from_db, mod_pos};
use ndarray::{Array2, Array3};
use num_complex::Complex64;
use rayon::prelude::*;
use std::f64::consts::PI;
use tracing::debug;

/// Suppression window around an accepted peak: two sync symbol lengths
pub const PEAK_SUPPRESS_WIN: i64 = 274;

/// Frequency-shift a signal by `f` Hz at sample rate `fs`
pub(crate) fn fshift(x: &[Complex64], f: f64, fs: f64) -> Vec<Complex64> {
    x.iter()
        .enumerate()
        .map(|(n, v)| v * Complex64::from_polar(1.0, 2.0 * PI * f * n as f64 / fs))
        .collect()
}

/// Correlation power surfaces over one half-frame period.
pub struct PssSurface {
    /// Combined correlation power, indexed (n_id_2, freq index, offset)
    pub incoherent_single: Array3<f64>,
    /// Same, with delay-spread averaging over adjacent offsets
    pub incoherent: Array3<f64>,
    /// Best power over all frequencies, indexed (n_id_2, offset)
    pub collapsed_pow: Array2<f64>,
    /// Frequency index achieving [`Self::collapsed_pow`]
    pub collapsed_frq: Array2<usize>,
    /// Received power estimate per offset, aligned with the peaks
    pub sp_incoherent: Vec<f64>,
    pub n_comb_xc: usize,
    pub n_comb_sp: usize,
}

/// Received-power estimate over a two-symbol window at every offset,
/// combined across half-frames and aligned with the correlation peaks.
fn sp_est(capbuf: &[Complex64]) -> (Vec<f64>, usize) {
    let n_cap = capbuf.len();
    let n_comb_sp = (n_cap - 136 - 137) / HALF_FRAME;
    let n_sp = n_comb_sp * HALF_FRAME;

    let mut sp = vec![0.0f64; n_sp];
    let mut acc = 0.0;
    for s in &capbuf[..274] {
        acc += s.norm_sqr();
    }
    sp[0] = acc / 274.0;
    for t in 1..n_sp {
        acc += capbuf[t + 274 - 1].norm_sqr() - capbuf[t - 1].norm_sqr();
        sp[t] = acc / 274.0;
    }

    let mut combined = vec![0.0f64; HALF_FRAME];
    for m in 0..n_comb_sp {
        for idx in 0..HALF_FRAME {
            combined[idx] += sp[m * HALF_FRAME + idx];
        }
    }
    // Shift right by one template length to align with correlation peaks.
    let mut out = vec![0.0f64; HALF_FRAME];
    for (idx, v) in out.iter_mut().enumerate() {
        *v = combined[mod_pos(idx as i64 - 137, HALF_FRAME as i64)] / n_comb_sp as f64;
    }
    (out, n_comb_sp)
}

/// Correlate against all sequences and frequency hypotheses and build the
/// combined power surfaces.
pub fn xcorr_pss(
    capture: &CaptureBuffer,
    f_search_set: &[f64],
    config: &SearchConfig,
) -> Result<PssSurface, SearchError> {
    let capbuf = &capture.samples;
    let n_cap = capbuf.len();
    if n_cap < 2 * HALF_FRAME + 300 {
        return Err(SearchError::CaptureTooShort {
            needed: 2 * HALF_FRAME + 300,
            got: n_cap,
        });
    }
    let n_f = f_search_set.len();
    let n_xc = n_cap - (PSS_TD_LEN - 1);
    let n_comb_xc = (n_xc - 100) / HALF_FRAME;
    if n_comb_xc == 0 {
        return Err(SearchError::CaptureTooShort {
            needed: HALF_FRAME + 237,
            got: n_cap,
        });
    }
    let ds_comb_arm = config.ds_comb_arm;

    // One combined power row per (frequency, sequence); embarrassingly
    // parallel across the frequency grid.
    let rows: Vec<(usize, [Vec<f64>; 3])> = (0..n_f)
        .into_par_iter()
        .map(|foi| {
            let f_off = f_search_set[foi];
            let k_factor = (capture.fc_requested - f_off) / capture.fc_programmed;
            let fs = capture.fs_programmed * k_factor;
            let mut per_seq: [Vec<f64>; 3] = Default::default();
            for (t, out) in per_seq.iter_mut().enumerate() {
                let template: Vec<Complex64> = fshift(&PSS_TD[t], f_off, fs)
                    .into_iter()
                    .map(|v| v.conj() / PSS_TD_LEN as f64)
                    .collect();
                // Correlating at the full capture rate performs filtering
                // and correlation in one pass, so very large frequency
                // offsets remain detectable.
                let mut xc_pow = vec![0.0f64; n_xc];
                for (ind, p) in xc_pow.iter_mut().enumerate() {
                    let mut acc = Complex64::default();
                    for (m, tv) in template.iter().enumerate() {
                        acc += capbuf[ind + m] * tv;
                    }
                    *p = acc.norm_sqr();
                }
                let mut comb = vec![0.0f64; HALF_FRAME];
                for m in 0..n_comb_xc {
                    let start = (m as f64 * 0.005 * k_factor * capture.fs_programmed).round()
                        as usize;
                    for (idx, c) in comb.iter_mut().enumerate() {
                        *c += xc_pow[idx + start];
                    }
                }
                for c in comb.iter_mut() {
                    *c /= n_comb_xc as f64;
                }
                *out = comb;
            }
            (foi, per_seq)
        })
        .collect();

    let mut incoherent_single = Array3::<f64>::zeros((3, n_f, HALF_FRAME));
    for (foi, per_seq) in rows {
        for (t, row) in per_seq.iter().enumerate() {
            for (idx, &v) in row.iter().enumerate() {
                incoherent_single[(t, foi, idx)] = v;
            }
        }
    }

    // Average adjacent offsets to tolerate delay spread.
    let mut incoherent = Array3::<f64>::zeros((3, n_f, HALF_FRAME));
    for t in 0..3 {
        for foi in 0..n_f {
            for idx in 0..HALF_FRAME as i64 {
                let mut acc = 0.0;
                for d in -(ds_comb_arm as i64)..=(ds_comb_arm as i64) {
                    acc += incoherent_single[(t, foi, mod_pos(idx + d, HALF_FRAME as i64))];
                }
                incoherent[(t, foi, idx as usize)] = acc / (2 * ds_comb_arm + 1) as f64;
            }
        }
    }

    // Keep only the best frequency per (sequence, offset).
    let mut collapsed_pow = Array2::<f64>::zeros((3, HALF_FRAME));
    let mut collapsed_frq = Array2::<usize>::zeros((3, HALF_FRAME));
    for t in 0..3 {
        for idx in 0..HALF_FRAME {
            let mut best = f64::NEG_INFINITY;
            let mut best_foi = 0;
            for foi in 0..n_f {
                let v = incoherent[(t, foi, idx)];
                if v > best {
                    best = v;
                    best_foi = foi;
                }
            }
            collapsed_pow[(t, idx)] = best;
            collapsed_frq[(t, idx)] = best_foi;
        }
    }

    let (sp_incoherent, n_comb_sp) = sp_est(capbuf);
    debug!(n_comb_xc, n_comb_sp, n_f, "PSS correlation surfaces built");

    Ok(PssSurface {
        incoherent_single,
        incoherent,
        collapsed_pow,
        collapsed_frq,
        sp_incoherent,
        n_comb_xc,
        n_comb_sp,
    })
}

/// Offset-dependent detection threshold.
///
/// Under noise only, the combined correlation power at one offset is a
/// scaled chi-square variable with `2 * n_comb_xc * (2 * ds_comb_arm + 1)`
/// degrees of freedom; the threshold is its far-tail quantile scaled by
/// the local received power. The received-power estimate covers the full
/// sampled bandwidth while the sync sequences occupy only the center, so
/// the power is inflated by that occupancy ratio, which errs high.
fn detection_threshold(surface: &PssSurface, config: &SearchConfig) -> Vec<f64> {
    let n = surface.n_comb_xc * (2 * config.ds_comb_arm + 1);
    let r_th = chi2_inv(config.threshold_quantile, 2.0 * n as f64);
    let rx_cutoff = (6.0 * 12.0 * 15.0e3 / 2.0 + 4.0 * 15.0e3) / (FS_LTE / 16.0 / 2.0);
    surface
        .sp_incoherent
        .iter()
        .map(|&sp| r_th * sp / rx_cutoff / PSS_TD_LEN as f64 / 2.0 / n as f64)
        .collect()
}

/// Iteratively extract correlation peaks as cell candidates.
pub fn peak_search(
    surface: &PssSurface,
    f_search_set: &[f64],
    capture: &CaptureBuffer,
    config: &SearchConfig,
) -> Vec<CellCandidate> {
    let z_th = detection_threshold(surface, config);
    let arm = config.ds_comb_arm as i64;
    // Owned working copy; suppression destroys it.
    let mut working = surface.collapsed_pow.clone();
    let mut cells = Vec::new();

    loop {
        let mut peak_pow = f64::NEG_INFINITY;
        let mut peak_t = 0usize;
        let mut peak_ind = 0usize;
        for t in 0..3 {
            for idx in 0..HALF_FRAME {
                if working[(t, idx)] > peak_pow {
                    peak_pow = working[(t, idx)];
                    peak_t = t;
                    peak_ind = idx;
                }
            }
        }
        if peak_pow < z_th[peak_ind] {
            break;
        }

        // The collapsed value sums energy over the delay-spread window;
        // refine to the strongest single tap on the pre-collapse surface.
        let foi = surface.collapsed_frq[(peak_t, peak_ind)];
        let mut best_pow = f64::NEG_INFINITY;
        let mut best_ind = peak_ind;
        for d in -arm..=arm {
            let w = mod_pos(peak_ind as i64 + d, HALF_FRAME as i64);
            let v = surface.incoherent_single[(peak_t, foi, w)];
            if v > best_pow {
                best_pow = v;
                best_ind = w;
            }
        }

        debug!(
            n_id_2 = peak_t,
            ind = best_ind,
            freq = f_search_set[foi],
            pow_db = common::utils::to_db(peak_pow),
            "PSS peak accepted"
        );
        cells.push(CellCandidate {
            n_id_2: peak_t as u8,
            peak_index: best_ind as f64,
            freq: f_search_set[foi],
            pss_pow: peak_pow,
            fc_requested: capture.fc_requested,
            fc_programmed: capture.fc_programmed,
            fs_programmed: capture.fs_programmed,
        });

        // Same sequence: nothing else within the suppression window.
        for d in -PEAK_SUPPRESS_WIN..=PEAK_SUPPRESS_WIN {
            working[(peak_t, mod_pos(peak_ind as i64 + d, HALF_FRAME as i64))] = 0.0;
        }
        // Other sequences: cross-correlation leakage near the peak.
        let xtalk = peak_pow * from_db(-config.cross_seq_margin_db);
        for t in 0..3 {
            if t == peak_t {
                continue;
            }
            for d in -PEAK_SUPPRESS_WIN..=PEAK_SUPPRESS_WIN {
                let w = mod_pos(peak_ind as i64 + d, HALF_FRAME as i64);
                if working[(t, w)] >= xtalk {
                    working[(t, w)] = 0.0;
                }
            }
        }
        // Reference-signal repetition produces echoes of this peak well
        // below it at every pilot symbol; drop everything that far down.
        let floor = peak_pow * from_db(-config.repetition_floor_db);
        for t in 0..3 {
            for idx in 0..HALF_FRAME {
                if working[(t, idx)] < floor {
                    working[(t, idx)] = 0.0;
                }
            }
        }
    }
    cells
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn noise_capture(rng: &mut StdRng, n: usize, sigma: f64) -> CaptureBuffer {
        let samples = (0..n)
            .map(|_| {
                Complex64::new(
                    sigma * (rng.gen::<f64>() - 0.5),
                    sigma * (rng.gen::<f64>() - 0.5),
                )
            })
            .collect();
        CaptureBuffer::new(samples, 739e6, 739e6, 1.92e6, 1.92e6).unwrap()
    }

    fn inject_pss(cap: &mut CaptureBuffer, n_id_2: usize, offset: usize, amp: f64) {
        let td = &PSS_TD[n_id_2];
        let mut start = offset;
        while start + PSS_TD_LEN < cap.samples.len() {
            for (m, &v) in td.iter().enumerate() {
                cap.samples[start + m] += amp * v;
            }
            start += HALF_FRAME;
        }
    }

    #[test]
    fn test_peak_found_at_injected_offset() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut cap = noise_capture(&mut rng, 3 * HALF_FRAME + 400, 0.02);
        inject_pss(&mut cap, 1, 1042, 0.3);

        let config = SearchConfig::default();
        let surface = xcorr_pss(&cap, &[0.0], &config).unwrap();
        let cells = peak_search(&surface, &[0.0], &cap, &config);

        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].n_id_2, 1);
        let err = (cells[0].peak_index - 1042.0).abs();
        assert!(err <= config.ds_comb_arm as f64, "offset error {err}");
        assert_eq!(cells[0].freq, 0.0);
    }

    #[test]
    fn test_cross_sequence_leakage_not_reported() {
        // A single strong transmitter leaks into the other two root
        // sequences at several dB below its own peak; none of that
        // leakage may come back as a candidate.
        let mut rng = StdRng::seed_from_u64(10);
        let mut cap = noise_capture(&mut rng, 3 * HALF_FRAME + 400, 0.02);
        inject_pss(&mut cap, 2, 3000, 0.5);

        let config = SearchConfig::default();
        let surface = xcorr_pss(&cap, &[0.0], &config).unwrap();
        let cells = peak_search(&surface, &[0.0], &cap, &config);

        assert_eq!(cells.len(), 1, "candidates: {cells:?}");
        assert_eq!(cells[0].n_id_2, 2);
    }

    #[test]
    fn test_pure_noise_yields_no_peaks() {
        let mut rng = StdRng::seed_from_u64(8);
        let cap = noise_capture(&mut rng, 3 * HALF_FRAME + 400, 0.05);
        let config = SearchConfig::default();
        let surface = xcorr_pss(&cap, &[0.0], &config).unwrap();
        let cells = peak_search(&surface, &[0.0], &cap, &config);
        assert!(cells.is_empty(), "false alarms: {cells:?}");
    }

    #[test]
    fn test_no_second_peak_within_suppression_window() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut cap = noise_capture(&mut rng, 3 * HALF_FRAME + 400, 0.02);
        inject_pss(&mut cap, 0, 500, 0.3);
        inject_pss(&mut cap, 0, 600, 0.25);

        let config = SearchConfig::default();
        let surface = xcorr_pss(&cap, &[0.0], &config).unwrap();
        let cells = peak_search(&surface, &[0.0], &cap, &config);

        let same: Vec<f64> = cells
            .iter()
            .filter(|c| c.n_id_2 == 0)
            .map(|c| c.peak_index)
            .collect();
        for i in 0..same.len() {
            for j in i + 1..same.len() {
                let d = (same[i] - same[j]).abs();
                let d = d.min(HALF_FRAME as f64 - d);
                assert!(d > PEAK_SUPPRESS_WIN as f64, "peaks {d} samples apart");
            }
        }
    }

    #[test]
    fn test_capture_too_short() {
        let cap = CaptureBuffer::new(
            vec![Complex64::default(); 5000],
            739e6,
            739e6,
            1.92e6,
            1.92e6,
        )
        .unwrap();
        let config = SearchConfig::default();
        assert!(matches!(
            xcorr_pss(&cap, &[0.0], &config),
            Err(SearchError::CaptureTooShort { .. })
        ));
    }
}
