//! SSS Detection and CP/Timing Resolution
//!
//! Uses the coarse PSS timing to channel-estimate every sync repetition in
//! the capture, then runs a maximum-likelihood search over all 168 group
//! identities, both CP hypotheses and both orderings of the two half-frame
//! sequences. The winner fixes the group identity, the CP type and the
//! frame start.

use crate::constants::{FS_LTE, HALF_FRAME, NFFT, N_SC_SYNC, PSS_FD, SSS_FD};
use crate::pss::fshift;
use crate::{SearchConfig, SearchError};
use capture::CaptureBuffer;
use common::types::{CellCandidate, CpType, DuplexMode, SyncedCell};
use common::utils::{sigpower, wrap};
use ndarray::Array2;
use num_complex::Complex64;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;
use tracing::debug;

// Noise power estimates appear in denominators; zero would only occur on
// degenerate synthetic input.
const NP_FLOOR: f64 = 1e-300;

/// Frequency-offset-corrected DFT of one sync symbol, returning the 62
/// occupied subcarriers.
pub(crate) struct SyncDft {
    fft: Arc<dyn Fft<f64>>,
}

impl SyncDft {
    pub(crate) fn new() -> Self {
        Self {
            fft: FftPlanner::new().plan_fft_forward(NFFT),
        }
    }

    /// `samps` must hold one DFT worth of samples starting two samples
    /// early; the two-sample offset keeps the window inside the CP.
    pub(crate) fn extract(
        &self,
        samps: &[Complex64],
        freq: f64,
        fs_eff: f64,
    ) -> [Complex64; N_SC_SYNC] {
        let mut buf = fshift(&samps[..NFFT], freq, fs_eff);
        buf.rotate_left(2);
        self.fft.process(&mut buf);
        let mut out = [Complex64::default(); N_SC_SYNC];
        for i in 0..31 {
            out[i] = buf[97 + i];
            out[31 + i] = buf[1 + i];
        }
        out
    }
}

/// Average the 13 nearest subcarriers of each raw channel-estimate row.
pub(crate) fn smooth_row(raw: &[Complex64; N_SC_SYNC]) -> [Complex64; N_SC_SYNC] {
    let mut sm = [Complex64::default(); N_SC_SYNC];
    for (t, v) in sm.iter_mut().enumerate() {
        let lt = t.saturating_sub(6);
        let rt = (t + 6).min(N_SC_SYNC - 1);
        let sum: Complex64 = raw[lt..=rt].iter().sum();
        *v = sum / (rt - lt + 1) as f64;
    }
    sm
}

struct SssEstimates {
    np_h1: [f64; N_SC_SYNC],
    np_h2: [f64; N_SC_SYNC],
    nrm_h1: [Complex64; N_SC_SYNC],
    nrm_h2: [Complex64; N_SC_SYNC],
    ext_h1: [Complex64; N_SC_SYNC],
    ext_h2: [Complex64; N_SC_SYNC],
}

/// Structural offsets, in search-rate samples, between the PSS and the
/// candidate SSS positions.
struct DuplexGeometry {
    min_idx: f64,
    sss_nrm_offset: usize,
    sss_ext_offset: usize,
}

impl DuplexGeometry {
    fn new(duplex_mode: DuplexMode) -> Self {
        match duplex_mode {
            // FDD: the SSS immediately precedes the PSS.
            DuplexMode::Fdd => Self {
                min_idx: 163.0 - 9.0,
                sss_nrm_offset: 128 + 9,
                sss_ext_offset: 128 + 32,
            },
            // TDD: the SSS sits three symbols ahead of the PSS.
            DuplexMode::Tdd => Self {
                min_idx: (3 * (128 + 32) + 32) as f64,
                sss_nrm_offset: 412,
                sss_ext_offset: 3 * (128 + 32),
            },
        }
    }
}

fn getce_sss(
    cand: &CellCandidate,
    capture: &CaptureBuffer,
    duplex_mode: DuplexMode,
) -> Result<SssEstimates, SearchError> {
    let capbuf = &capture.samples;
    let n_cap = capbuf.len();
    let k_factor = cand.k_factor();
    let fs_eff = capture.fs_programmed * k_factor;
    let unit = 16.0 / FS_LTE * fs_eff;
    let geo = DuplexGeometry::new(duplex_mode);

    // Skip ahead half a frame if there is no room for the SSS before the
    // first PSS.
    let mut peak_loc = cand.peak_index;
    if peak_loc < geo.min_idx {
        peak_loc += HALF_FRAME as f64 * unit;
    }

    // All PSS locations where the paired SSS is also inside the capture.
    let mut pss_loc_set = Vec::new();
    let mut loc = peak_loc;
    while loc <= (n_cap - 134) as f64 {
        pss_loc_set.push(loc);
        loc += HALF_FRAME as f64 * unit;
    }
    let n_pss = pss_loc_set.len();
    if n_pss < 2 {
        return Err(SearchError::CaptureTooShort {
            needed: 2 * HALF_FRAME + 300,
            got: n_cap,
        });
    }

    let dft = SyncDft::new();
    let pss_fd = &PSS_FD[cand.n_id_2 as usize];
    let mut pss_np = vec![0.0f64; n_pss];
    let mut h_sm = Array2::<Complex64>::zeros((n_pss, N_SC_SYNC));
    let mut sss_nrm_raw = Array2::<Complex64>::zeros((n_pss, N_SC_SYNC));
    let mut sss_ext_raw = Array2::<Complex64>::zeros((n_pss, N_SC_SYNC));

    for (k, &loc_f) in pss_loc_set.iter().enumerate() {
        let pss_loc = loc_f.round() as usize;
        let pss_dft_location = pss_loc + 9 - 2;
        if pss_dft_location + NFFT > n_cap {
            return Err(SearchError::CaptureTooShort {
                needed: pss_dft_location + NFFT,
                got: n_cap,
            });
        }

        let psss = dft.extract(
            &capbuf[pss_dft_location..pss_dft_location + NFFT],
            -cand.freq,
            fs_eff,
        );
        let mut h_raw = [Complex64::default(); N_SC_SYNC];
        for t in 0..N_SC_SYNC {
            h_raw[t] = psss[t] * pss_fd[t].conj();
        }
        let sm = smooth_row(&h_raw);
        let resid: Vec<Complex64> = (0..N_SC_SYNC).map(|t| sm[t] - h_raw[t]).collect();
        pss_np[k] = sigpower(&resid).max(NP_FLOOR);
        for t in 0..N_SC_SYNC {
            h_sm[(k, t)] = sm[t];
        }

        let ext_loc = pss_dft_location - geo.sss_ext_offset;
        let ext = dft.extract(&capbuf[ext_loc..ext_loc + NFFT], -cand.freq, fs_eff);
        let nrm_loc = pss_dft_location - geo.sss_nrm_offset;
        let nrm = dft.extract(&capbuf[nrm_loc..nrm_loc + NFFT], -cand.freq, fs_eff);
        for t in 0..N_SC_SYNC {
            sss_ext_raw[(k, t)] = ext[t];
            sss_nrm_raw[(k, t)] = nrm[t];
        }
    }

    // Combine repetitions with per-subcarrier MMSE weighting; even
    // repetitions belong to one half-frame, odd to the other.
    let mut est = SssEstimates {
        np_h1: [0.0; N_SC_SYNC],
        np_h2: [0.0; N_SC_SYNC],
        nrm_h1: [Complex64::default(); N_SC_SYNC],
        nrm_h2: [Complex64::default(); N_SC_SYNC],
        ext_h1: [Complex64::default(); N_SC_SYNC],
        ext_h2: [Complex64::default(); N_SC_SYNC],
    };
    for t in 0..N_SC_SYNC {
        for half in 0..2 {
            let rows: Vec<usize> = (half..n_pss).step_by(2).collect();
            let np_est = 1.0
                / (1.0
                    + rows
                        .iter()
                        .map(|&k| h_sm[(k, t)].norm_sqr() / pss_np[k])
                        .sum::<f64>());
            let combine = |raw: &Array2<Complex64>| {
                np_est
                    * rows
                        .iter()
                        .map(|&k| h_sm[(k, t)].conj() / pss_np[k] * raw[(k, t)])
                        .sum::<Complex64>()
            };
            if half == 0 {
                est.np_h1[t] = np_est;
                est.nrm_h1[t] = combine(&sss_nrm_raw);
                est.ext_h1[t] = combine(&sss_ext_raw);
            } else {
                est.np_h2[t] = np_est;
                est.nrm_h2[t] = combine(&sss_nrm_raw);
                est.ext_h2[t] = combine(&sss_ext_raw);
            }
        }
    }
    Ok(est)
}

/// Phase-aligned log likelihood of one candidate sequence pair.
fn ml_helper(np: &[f64], est: &[Complex64], try_seq: &[f64]) -> f64 {
    let m: Complex64 = est
        .iter()
        .zip(try_seq.iter())
        .map(|(e, &s)| e.conj() * s)
        .sum();
    let rot = Complex64::from_polar(1.0, -m.arg());
    let mut log_lik = 0.0;
    for ((e, &s), &n) in est.iter().zip(try_seq.iter()).zip(np.iter()) {
        let diff = s * rot - e;
        log_lik -= (diff.re * diff.re + diff.im * diff.im) / n;
    }
    log_lik
}

/// Detect the SSS for one candidate, or return `None` if the winning
/// likelihood is not significant against the candidate population.
pub fn sss_detect(
    cand: &CellCandidate,
    capture: &CaptureBuffer,
    duplex_mode: DuplexMode,
    config: &SearchConfig,
) -> Result<Option<SyncedCell>, SearchError> {
    let est = getce_sss(cand, capture, duplex_mode)?;

    let np_h12: Vec<f64> = est.np_h1.iter().chain(est.np_h2.iter()).copied().collect();
    let nrm_h12: Vec<Complex64> = est
        .nrm_h1
        .iter()
        .chain(est.nrm_h2.iter())
        .copied()
        .collect();
    let ext_h12: Vec<Complex64> = est
        .ext_h1
        .iter()
        .chain(est.ext_h2.iter())
        .copied()
        .collect();

    let mut log_lik_nrm = Array2::<f64>::zeros((168, 2));
    let mut log_lik_ext = Array2::<f64>::zeros((168, 2));
    for g in 0..168usize {
        let h1_try = &SSS_FD[g][cand.n_id_2 as usize][0];
        let h2_try = &SSS_FD[g][cand.n_id_2 as usize][1];
        let mut try_12 = [0.0f64; 2 * N_SC_SYNC];
        let mut try_21 = [0.0f64; 2 * N_SC_SYNC];
        try_12[..N_SC_SYNC].copy_from_slice(h1_try);
        try_12[N_SC_SYNC..].copy_from_slice(h2_try);
        try_21[..N_SC_SYNC].copy_from_slice(h2_try);
        try_21[N_SC_SYNC..].copy_from_slice(h1_try);

        log_lik_nrm[(g, 0)] = ml_helper(&np_h12, &nrm_h12, &try_12);
        log_lik_nrm[(g, 1)] = ml_helper(&np_h12, &nrm_h12, &try_21);
        log_lik_ext[(g, 0)] = ml_helper(&np_h12, &ext_h12, &try_12);
        log_lik_ext[(g, 1)] = ml_helper(&np_h12, &ext_h12, &try_21);
    }

    let max_of = |a: &Array2<f64>| a.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let (log_lik, cp_type) = if max_of(&log_lik_nrm) > max_of(&log_lik_ext) {
        (&log_lik_nrm, CpType::Normal)
    } else {
        (&log_lik_ext, CpType::Extended)
    };

    // Frame start is defined as the start of the CP of the frame; a DFT
    // taken at frame_start + cp_len is expected to measure a two-sample
    // time offset.
    let k_factor = cand.k_factor();
    let unit = 16.0 / FS_LTE * capture.fs_programmed * k_factor;
    let mut frame_start = match (duplex_mode, cp_type) {
        (DuplexMode::Fdd, _) => cand.peak_index + (128.0 + 9.0 - 960.0 - 2.0) * unit,
        (DuplexMode::Tdd, CpType::Normal) => {
            cand.peak_index + (-(2.0 * (128.0 + 9.0) + 1.0) - 1920.0 - 2.0) * unit
        }
        (DuplexMode::Tdd, CpType::Extended) => {
            cand.peak_index + (-(2.0 * (128.0 + 32.0)) - 1920.0 - 2.0) * unit
        }
    };

    let col_max = |c: usize| (0..168).map(|g| log_lik[(g, c)]).fold(f64::NEG_INFINITY, f64::max);
    let order = if col_max(0) > col_max(1) { 0 } else { 1 };
    if order == 1 {
        // The first detected sync repetition was the second half-frame.
        frame_start += HALF_FRAME as f64 * unit;
    }
    frame_start = wrap(frame_start, -0.5, (2.0 * HALF_FRAME as f64 - 0.5) * unit);

    let mut n_id_1 = 0usize;
    let mut lik_final = f64::NEG_INFINITY;
    for g in 0..168 {
        if log_lik[(g, order)] > lik_final {
            lik_final = log_lik[(g, order)];
            n_id_1 = g;
        }
    }

    // Significance test against the whole candidate population.
    let all: Vec<f64> = log_lik_nrm.iter().chain(log_lik_ext.iter()).copied().collect();
    let mean = all.iter().sum::<f64>() / all.len() as f64;
    let var = all.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (all.len() - 1) as f64;
    if lik_final < mean + var.sqrt() * config.sss_n_sigma {
        debug!(
            n_id_2 = cand.n_id_2,
            lik_final, mean, "SSS likelihood not significant"
        );
        return Ok(None);
    }

    debug!(
        n_id_1,
        ?cp_type,
        frame_start,
        lik_final,
        "SSS detected"
    );
    Ok(Some(SyncedCell {
        candidate: cand.clone(),
        n_id_1: n_id_1 as u16,
        cp_type,
        frame_start,
        duplex_mode,
        sss_log_lik: lik_final,
    }))
}
