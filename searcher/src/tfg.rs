//! Time-Frequency Grid Extraction
//!
//! Converts the frequency-corrected capture into a grid of OFDM symbols by
//! 72 center subcarriers, covering six frames plus two slots. Each DFT is
//! taken at the nearest sample boundary to its ideal fractional position;
//! the ideal position is kept as a per-row timestamp and the sub-sample
//! lateness is compensated as a phase ramp across subcarriers.

use crate::constants::{FS_LTE, NFFT};
use crate::pss::fshift;
use crate::sync::grid_cn;
use crate::{SearchError, N_SC_GRID};
use capture::CaptureBuffer;
use common::types::CpType;
use common::types::TunedCell;
use ndarray::Array2;
use num_complex::Complex64;
use rustfft::FftPlanner;
use std::f64::consts::PI;
use tracing::debug;

/// Number of OFDM symbols extracted: six frames plus two slots
pub fn n_ofdm_sym(n_symb_dl: usize) -> usize {
    6 * 10 * 2 * n_symb_dl + 2 * n_symb_dl
}

/// Extract the time-frequency grid and per-row ideal timestamps.
pub fn extract_tfg(
    tuned: &TunedCell,
    capture: &CaptureBuffer,
) -> Result<(Array2<Complex64>, Vec<f64>), SearchError> {
    let k_factor = tuned.k_factor();
    let fs_eff = capture.fs_programmed * k_factor;
    let unit = 16.0 / FS_LTE * capture.fs_programmed * k_factor;
    let n_symb_dl = tuned.n_symb_dl();

    let mut dft_location = match tuned.synced.cp_type {
        CpType::Normal => tuned.synced.frame_start + 10.0 * unit,
        CpType::Extended => tuned.synced.frame_start + 32.0 * unit,
    };
    // Start a frame earlier when the capture has room; more symbols means
    // more MIB combining gain.
    if dft_location - 0.01 * fs_eff > -0.5 {
        dft_location -= 0.01 * fs_eff;
    }

    let capbuf = fshift(&capture.samples, -tuned.freq_fine, fs_eff);
    let fft = FftPlanner::new().plan_fft_forward(NFFT);

    let n_ofdm = n_ofdm_sym(n_symb_dl);
    let mut tfg = Array2::<Complex64>::zeros((n_ofdm, N_SC_GRID));
    let mut tfg_timestamp = vec![0.0f64; n_ofdm];

    let mut sym_num = 0usize;
    for t in 0..n_ofdm {
        let start = dft_location.round() as usize;
        if start + NFFT > capbuf.len() {
            return Err(SearchError::CaptureTooShort {
                needed: start + NFFT,
                got: capbuf.len(),
            });
        }
        let mut buf: Vec<Complex64> = capbuf[start..start + NFFT].to_vec();
        fft.process(&mut buf);
        for i in 0..36 {
            tfg[(t, i)] = buf[92 + i];
            tfg[(t, 36 + i)] = buf[1 + i];
        }
        tfg_timestamp[t] = dft_location;

        if n_symb_dl == 6 {
            dft_location += (128.0 + 32.0) * unit;
        } else {
            dft_location += if sym_num == 6 {
                (128.0 + 10.0) * unit
            } else {
                (128.0 + 9.0) * unit
            };
            sym_num = (sym_num + 1) % 7;
        }
    }

    // Compensate the sub-sample lateness of each DFT.
    for t in 0..n_ofdm {
        let late = tfg_timestamp[t].round() - tfg_timestamp[t];
        for c in 0..N_SC_GRID {
            let rot = Complex64::from_polar(1.0, -2.0 * PI * late / 128.0 * grid_cn(c));
            tfg[(t, c)] *= rot;
        }
    }

    debug!(n_ofdm, frame_start = tuned.synced.frame_start, "grid extracted");
    Ok((tfg, tfg_timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::{CellCandidate, DuplexMode, SyncedCell};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    // OFDM-modulate a grid row into 128+cp time samples.
    fn ofdm_symbol(row: &[Complex64], cp: usize) -> Vec<Complex64> {
        let ifft = FftPlanner::new().plan_fft_inverse(NFFT);
        let mut bins = vec![Complex64::default(); NFFT];
        for i in 0..36 {
            bins[92 + i] = row[i];
            bins[1 + i] = row[36 + i];
        }
        ifft.process(&mut bins);
        for v in bins.iter_mut() {
            *v /= NFFT as f64;
        }
        let mut td = Vec::with_capacity(NFFT + cp);
        td.extend_from_slice(&bins[NFFT - cp..]);
        td.extend_from_slice(&bins);
        td
    }

    #[test]
    fn test_grid_roundtrip_normal_cp() {
        let mut rng = StdRng::seed_from_u64(21);
        let n_ofdm = n_ofdm_sym(7);
        let mut grid = Array2::<Complex64>::zeros((n_ofdm, N_SC_GRID));
        for v in grid.iter_mut() {
            *v = Complex64::new(
                if rng.gen::<bool>() { 0.7 } else { -0.7 },
                if rng.gen::<bool>() { 0.7 } else { -0.7 },
            );
        }

        // Synthesize with the true frame start at sample zero.
        let mut samples = Vec::new();
        for t in 0..n_ofdm {
            let cp = if t % 7 == 0 { 10 } else { 9 };
            let row: Vec<Complex64> = (0..N_SC_GRID).map(|c| grid[(t, c)]).collect();
            samples.extend(ofdm_symbol(&row, cp));
        }
        samples.resize(samples.len() + 400, Complex64::default());

        let capture = CaptureBuffer::new(samples, 739e6, 739e6, 1.92e6, 1.92e6).unwrap();
        let tuned = TunedCell {
            synced: SyncedCell {
                candidate: CellCandidate {
                    n_id_2: 0,
                    peak_index: 0.0,
                    freq: 0.0,
                    pss_pow: 1.0,
                    fc_requested: 739e6,
                    fc_programmed: 739e6,
                    fs_programmed: 1.92e6,
                },
                n_id_1: 0,
                cp_type: CpType::Normal,
                frame_start: 0.0,
                duplex_mode: DuplexMode::Fdd,
                sss_log_lik: 0.0,
            },
            freq_fine: 0.0,
        };

        let (tfg, ts) = extract_tfg(&tuned, &capture).unwrap();
        assert_eq!(tfg.nrows(), n_ofdm);
        // With an exact sample clock the timestamps are integers at the
        // nominal symbol spacing.
        assert!((ts[0] - 10.0).abs() < 1e-9);
        assert!((ts[1] - 147.0).abs() < 1e-9);
        for t in (0..n_ofdm).step_by(53) {
            for c in 0..N_SC_GRID {
                let d = tfg[(t, c)] - grid[(t, c)];
                assert!(d.norm() < 1e-9, "row {t} col {c} off by {}", d.norm());
            }
        }
    }

    #[test]
    fn test_grid_roundtrip_extended_cp() {
        let mut rng = StdRng::seed_from_u64(22);
        let n_ofdm = n_ofdm_sym(6);
        let mut grid = Array2::<Complex64>::zeros((n_ofdm, N_SC_GRID));
        for v in grid.iter_mut() {
            *v = Complex64::new(
                if rng.gen::<bool>() { 0.7 } else { -0.7 },
                if rng.gen::<bool>() { 0.7 } else { -0.7 },
            );
        }

        // Extended CP: every symbol carries a 32-sample prefix.
        let mut samples = Vec::new();
        for t in 0..n_ofdm {
            let row: Vec<Complex64> = (0..N_SC_GRID).map(|c| grid[(t, c)]).collect();
            samples.extend(ofdm_symbol(&row, 32));
        }
        samples.resize(samples.len() + 400, Complex64::default());

        let capture = CaptureBuffer::new(samples, 739e6, 739e6, 1.92e6, 1.92e6).unwrap();
        let tuned = TunedCell {
            synced: SyncedCell {
                candidate: CellCandidate {
                    n_id_2: 0,
                    peak_index: 0.0,
                    freq: 0.0,
                    pss_pow: 1.0,
                    fc_requested: 739e6,
                    fc_programmed: 739e6,
                    fs_programmed: 1.92e6,
                },
                n_id_1: 0,
                cp_type: CpType::Extended,
                frame_start: 0.0,
                duplex_mode: DuplexMode::Fdd,
                sss_log_lik: 0.0,
            },
            freq_fine: 0.0,
        };

        let (tfg, ts) = extract_tfg(&tuned, &capture).unwrap();
        assert_eq!(tfg.nrows(), n_ofdm);
        // Six symbols per slot at a uniform 160-sample spacing.
        assert!((ts[0] - 32.0).abs() < 1e-9);
        assert!((ts[1] - 192.0).abs() < 1e-9);
        for t in (0..n_ofdm).step_by(47) {
            for c in 0..N_SC_GRID {
                let d = tfg[(t, c)] - grid[(t, c)];
                assert!(d.norm() < 1e-9, "row {t} col {c} off by {}", d.norm());
            }
        }
    }
}
