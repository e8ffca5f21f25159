//! Fine and Superfine Frequency/Timing Synchronization
//!
//! Two refinement stages. The first compares the phase of the SSS against
//! the channel measured on the neighboring PSS; the known symbol distance
//! turns the phase difference into a frequency estimate far finer than the
//! search grid. The second measures the residual frequency and timing
//! offsets on the extracted resource grid using the reference signals and
//! compensates the grid in place.

use crate::constants::{FS_LTE, HALF_FRAME, NFFT, N_SC_SYNC, PSS_FD, SSS_FD};
use crate::rs::RsDl;
use crate::sss::{smooth_row, SyncDft};
use crate::{SearchError, N_SC_GRID};
use capture::CaptureBuffer;
use common::types::{CpType, DuplexMode, RefinedCell, SyncedCell, TunedCell};
use common::utils::{sigpower, wrap};
use ndarray::Array2;
use num_complex::Complex64;
use std::f64::consts::PI;
use tracing::debug;

/// Subcarrier index relative to DC for each grid column
pub(crate) fn grid_cn(col: usize) -> f64 {
    if col < 36 {
        col as f64 - 36.0
    } else {
        col as f64 - 35.0
    }
}

/// Estimate the frequency offset from the phase rotation between each SSS
/// and the channel measured on its paired PSS.
pub fn pss_sss_foe(
    synced: &SyncedCell,
    capture: &CaptureBuffer,
) -> Result<TunedCell, SearchError> {
    let cand = &synced.candidate;
    let capbuf = &capture.samples;
    let n_cap = capbuf.len();
    let k_factor = synced.k_factor();
    let unit = 16.0 / FS_LTE * capture.fs_programmed * k_factor;

    let (pss_sss_dist, first_offset) = match (synced.duplex_mode, synced.cp_type) {
        (DuplexMode::Fdd, CpType::Normal) => (
            ((128.0 + 9.0) * unit).round(),
            (960.0 - 128.0 - 9.0 - 128.0) * unit,
        ),
        (DuplexMode::Fdd, CpType::Extended) => (
            ((128.0 + 32.0) * unit).round(),
            (960.0 - 128.0 - 32.0 - 128.0) * unit,
        ),
        (DuplexMode::Tdd, CpType::Normal) => (
            ((3.0 * (128.0 + 9.0) + 1.0) * unit).round(),
            (1920.0 - 128.0) * unit,
        ),
        (DuplexMode::Tdd, CpType::Extended) => (
            ((3.0 * (128.0 + 32.0)) * unit).round(),
            (1920.0 - 128.0) * unit,
        ),
    };
    let dist = pss_sss_dist as usize;

    let mut first_sss_dft_location = wrap(
        synced.frame_start + first_offset,
        -0.5,
        2.0 * HALF_FRAME as f64 - 0.5,
    );
    // Which half-frame the first visible SSS belongs to.
    let mut half = 0usize;
    if first_sss_dft_location - HALF_FRAME as f64 * unit > -0.5 {
        first_sss_dft_location -= HALF_FRAME as f64 * unit;
        half = 1;
    }

    let mut sss_dft_loc_set = Vec::new();
    let mut loc = first_sss_dft_location;
    let limit = (n_cap as f64) - 127.0 - pss_sss_dist - 100.0;
    while loc <= limit {
        sss_dft_loc_set.push(loc);
        loc += HALF_FRAME as f64 * unit;
    }
    if sss_dft_loc_set.is_empty() {
        return Err(SearchError::CaptureTooShort {
            needed: 2 * HALF_FRAME,
            got: n_cap,
        });
    }

    let dft = SyncDft::new();
    let fs_eff = capture.fs_programmed * k_factor;
    let pss_fd = &PSS_FD[cand.n_id_2 as usize];
    // Fixed rotation undoing the frequency-offset phase accumulated over
    // the PSS/SSS separation.
    let sep_rot = Complex64::from_polar(
        1.0,
        PI * -cand.freq / (FS_LTE / 16.0 / 2.0) * -(pss_sss_dist),
    );

    let mut m_acc = Complex64::default();
    for &loc_f in &sss_dft_loc_set {
        let sss_seq = &SSS_FD[synced.n_id_1 as usize][cand.n_id_2 as usize][half];
        half = 1 - half;

        let sss_dft_location = loc_f.round() as usize;
        let pss_dft_location = sss_dft_location + dist;
        if pss_dft_location + NFFT > n_cap {
            break;
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
        let h_sm = smooth_row(&h_raw);
        let resid: Vec<Complex64> = (0..N_SC_SYNC).map(|t| h_sm[t] - h_raw[t]).collect();
        let np = sigpower(&resid).max(1e-300);

        let sss_raw = dft.extract(
            &capbuf[sss_dft_location..sss_dft_location + NFFT],
            -cand.freq,
            fs_eff,
        );
        for t in 0..N_SC_SYNC {
            let sss_comp = sss_raw[t] * sep_rot * sss_seq[t];
            let h2 = h_sm[t].norm_sqr();
            let weight = h2 / (2.0 * h2 * np + np * np);
            m_acc += sss_comp.conj() * h_raw[t] * weight;
        }
    }

    let freq_fine =
        cand.freq + m_acc.arg() / (2.0 * PI) * (capture.fs_programmed * k_factor) / pss_sss_dist;
    debug!(freq_coarse = cand.freq, freq_fine, "PSS/SSS frequency estimate");
    Ok(TunedCell {
        synced: synced.clone(),
        freq_fine,
    })
}

/// Measure and compensate the residual frequency and timing offsets on the
/// extracted grid. The grid and its timestamps are rewritten in place.
///
/// After frequency compensation, a fully loaded grid would satisfy
/// `arg(E[conj(g(t,f)) g(t+1,f)]) = 0`; after timing compensation the same
/// holds across subcarriers.
pub fn tfoec(
    tuned: &TunedCell,
    tfg: &mut Array2<Complex64>,
    tfg_timestamp: &mut [f64],
    rs_dl: &RsDl,
) -> RefinedCell {
    let n_symb_dl = tuned.n_symb_dl();
    let n_ofdm = tfg.nrows();
    let n_slot = n_ofdm / n_symb_dl;
    let cand = &tuned.synced.candidate;

    // Residual FOE from slot-to-slot phase drift on the pilots.
    let mut foe = Complex64::default();
    for sym_num in [0, n_symb_dl - 3] {
        let mut rs_extracted = Array2::<Complex64>::zeros((n_slot, 12));
        for t in 0..n_slot {
            let shift = rs_dl.get_shift(t % 20, sym_num, 0);
            let rs = rs_dl.get_rs(t % 20, sym_num).unwrap();
            for (i, r) in rs.iter().enumerate() {
                rs_extracted[(t, i)] = tfg[(t * n_symb_dl + sym_num, shift + 6 * i)] * r.conj();
            }
        }
        for i in 0..12 {
            for t in 0..n_slot - 1 {
                foe += rs_extracted[(t, i)].conj() * rs_extracted[(t + 1, i)];
            }
        }
    }
    let residual_f = foe.arg() / (2.0 * PI) / 0.0005;

    let k_factor_residual = (cand.fc_requested - residual_f) / cand.fc_programmed;

    // FOC plus the timestamp rescaling it implies. Does not fix ICI.
    for t in 0..n_ofdm {
        let ts = tfg_timestamp[t];
        let ts_comp = k_factor_residual * ts;
        tfg_timestamp[t] = ts_comp;
        let foc = Complex64::from_polar(1.0, 2.0 * PI * -residual_f * ts_comp / (FS_LTE / 16.0));
        let late = ts - ts_comp;
        for c in 0..N_SC_GRID {
            let toc = Complex64::from_polar(1.0, -2.0 * PI * late / 128.0 * grid_cn(c));
            tfg[(t, c)] *= foc * toc;
        }
    }

    // TOE by comparing subcarrier k of one pilot symbol against subcarrier
    // k+3 of the next; requires FOC to have run first.
    let mut toe = Complex64::default();
    for t in 0..2 * n_slot - 1 {
        let sym_of = |i: usize| if i & 1 == 1 { n_symb_dl - 3 } else { 0 };
        let current = (sym_of(t), (t >> 1) % 20, (t >> 1) * n_symb_dl + sym_of(t));
        let next = (
            sym_of(t + 1),
            ((t + 1) >> 1) % 20,
            ((t + 1) >> 1) * n_symb_dl + sym_of(t + 1),
        );
        // Port 0 shifts do not depend on the slot.
        let (r1, r2) = if rs_dl.get_shift(0, current.0, 0) < rs_dl.get_shift(0, next.0, 0) {
            (current, next)
        } else {
            (next, current)
        };
        let extract = |(sym, slot, row): (usize, usize, usize)| -> Vec<Complex64> {
            let shift = rs_dl.get_shift(0, sym, 0);
            let rs = rs_dl.get_rs(slot, sym).unwrap();
            rs.iter()
                .enumerate()
                .map(|(i, r)| tfg[(row, shift + 6 * i)] * r.conj())
                .collect()
        };
        let r1v = extract(r1);
        let r2v = extract(r2);
        for i in 0..12 {
            toe += r1v[i].conj() * r2v[i];
        }
        for i in 0..11 {
            toe += r2v[i].conj() * r1v[i + 1];
        }
    }
    let delay = -toe.arg() / 3.0 / (2.0 * PI / 128.0);

    // TOC
    for t in 0..n_ofdm {
        for c in 0..N_SC_GRID {
            let rot = Complex64::from_polar(1.0, 2.0 * PI / 128.0 * delay * grid_cn(c));
            tfg[(t, c)] *= rot;
        }
    }

    debug!(residual_f, delay, "superfine frequency/timing estimate");
    RefinedCell {
        tuned: tuned.clone(),
        freq_superfine: tuned.freq_fine + residual_f,
    }
}
