//! End-to-end search over a synthetic downlink capture.
//!
//! Eight frames of OFDM are generated at 1.92 Msps with synchronization
//! signals, cell-specific reference signals on two ports and the
//! broadcast channel, then pushed through the full pipeline.

use capture::{CaptureBuffer, CAPLENGTH};
use common::types::{CpType, DlBandwidth, DuplexMode, PhichDuration, PhichResource};
use common::utils::{crc16, unpack_bits};
use ndarray::Array2;
use num_complex::Complex64;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustfft::FftPlanner;
use searcher::coding::{conv_encode, pn_sequence, qpsk_modulate, rate_match};
use searcher::constants::{NFFT, PSS_FD, SSS_FD};
use searcher::rs::RsDl;
use searcher::{search_cells, SearchConfig, N_SC_GRID};
use std::f64::consts::{PI, SQRT_2};

const N_ID_1: u16 = 5;
const N_ID_2: u8 = 1;
const N_ID_CELL: u16 = 3 * N_ID_1 + N_ID_2 as u16;
const N_SYMB: usize = 7;
const ROWS_PER_FRAME: usize = 10 * 2 * N_SYMB;

/// First SFN in the capture; 137 = 4 * 35 - 3, so the 40 ms broadcast
/// period starts three frames in.
const SFN0: u16 = 137;

fn place_sync(row: &mut [Complex64], values: &[f64; 62]) {
    for (i, &v) in values.iter().enumerate() {
        row[5 + i] = Complex64::new(v, 0.0);
    }
}

/// One 40 ms broadcast coded block as QPSK symbols, already scrambled.
fn pbch_block(sfn_base: u16) -> Vec<Complex64> {
    let mut bits = Vec::with_capacity(24);
    bits.extend(unpack_bits(2, 3)); // 25 RB
    bits.push(0); // normal PHICH duration
    bits.extend(unpack_bits(2, 2)); // PHICH resource one
    bits.extend(unpack_bits(sfn_base as u32 / 4, 8));
    bits.extend(std::iter::repeat(0).take(10));
    let crc = crc16(&bits) ^ 0xffff; // two-port mask
    bits.extend(unpack_bits(crc as u32, 16));

    let streams = conv_encode(&bits);
    let mut e = rate_match(&streams, 1920);
    let scr = pn_sequence(N_ID_CELL as u32, 1920);
    for (b, &c) in e.iter_mut().zip(scr.iter()) {
        *b ^= c;
    }
    qpsk_modulate(&e)
}

/// Write one frame's quarter of the broadcast block into the grid with
/// two-port space-frequency block coding over unit channels.
fn place_pbch(grid: &mut Array2<Complex64>, frame: usize, sfn: u16) {
    let quarter = (sfn % 4) as usize;
    let block = pbch_block(sfn - sfn % 4);
    let seg = &block[quarter * 240..(quarter + 1) * 240];
    let v_shift_m3 = (N_ID_CELL % 3) as usize;

    let mut idx = 0usize;
    let mut res = Vec::with_capacity(240);
    for sym in 0..4usize {
        for sc in 0..N_SC_GRID {
            if sc % 3 == v_shift_m3 && (sym == 0 || sym == 1) {
                continue;
            }
            res.push((frame * ROWS_PER_FRAME + N_SYMB + sym, sc));
        }
    }
    assert_eq!(res.len(), 240);
    while idx < 240 {
        let a = seg[idx];
        let b = seg[idx + 1];
        grid[res[idx]] = (a - b.conj()) / SQRT_2;
        grid[res[idx + 1]] = (b + a.conj()) / SQRT_2;
        idx += 2;
    }
}

fn build_capture() -> CaptureBuffer {
    let n_frames = 8usize;
    let n_rows = n_frames * ROWS_PER_FRAME;
    let mut grid = Array2::<Complex64>::zeros((n_rows, N_SC_GRID));
    let rs_dl = RsDl::new(N_ID_CELL, CpType::Normal);

    // Reference signals, both ports, every slot.
    for row in 0..n_rows {
        let slot = (row / N_SYMB) % 20;
        let sym = row % N_SYMB;
        if sym != 0 && sym != N_SYMB - 3 {
            continue;
        }
        let rs = rs_dl.get_rs(slot, sym).unwrap();
        for port in 0..2u8 {
            let sh = rs_dl.get_shift(slot, sym, port);
            for (i, &r) in rs.iter().enumerate() {
                grid[(row, sh + 6 * i)] = r;
            }
        }
    }

    // Synchronization signals in subframes 0 and 5.
    for f in 0..n_frames {
        for half in 0..2usize {
            let base = f * ROWS_PER_FRAME + half * 10 * N_SYMB;
            let mut pss = grid.row_mut(base + 6);
            for (i, &v) in PSS_FD[N_ID_2 as usize].iter().enumerate() {
                pss[5 + i] = v;
            }
            place_sync(
                grid.row_mut(base + 5).as_slice_mut().unwrap(),
                &SSS_FD[N_ID_1 as usize][N_ID_2 as usize][half],
            );
        }
    }

    // Broadcast channel, one quarter block per frame.
    for f in 0..n_frames {
        place_pbch(&mut grid, f, SFN0 + f as u16);
    }

    // OFDM modulation.
    let ifft = FftPlanner::new().plan_fft_inverse(NFFT);
    let mut samples = Vec::with_capacity(CAPLENGTH);
    for t in 0..n_rows {
        let mut bins = vec![Complex64::default(); NFFT];
        for i in 0..36 {
            bins[92 + i] = grid[(t, i)];
            bins[1 + i] = grid[(t, 36 + i)];
        }
        ifft.process(&mut bins);
        for v in bins.iter_mut() {
            *v /= NFFT as f64;
        }
        let cp = if t % N_SYMB == 0 { 10 } else { 9 };
        samples.extend_from_slice(&bins[NFFT - cp..]);
        samples.extend_from_slice(&bins);
    }
    assert_eq!(samples.len(), CAPLENGTH);

    // Additive noise at 0 dB per resource element.
    let mut rng = StdRng::seed_from_u64(61);
    let sigma = (1.0 / NFFT as f64 / 2.0).sqrt();
    for v in samples.iter_mut() {
        let r: f64 = rng.gen::<f64>().max(1e-12);
        let mag = sigma * (-2.0 * r.ln()).sqrt();
        let phase = 2.0 * PI * rng.gen::<f64>();
        *v += Complex64::from_polar(mag, phase);
    }

    CaptureBuffer::new(samples, 739e6, 739e6, 1.92e6, 1.92e6).unwrap()
}

#[test]
fn test_search_decodes_synthetic_cell() {
    let cap = build_capture();
    let config = SearchConfig::default();
    let cells = search_cells(&cap, &[0.0], &config).unwrap();

    assert_eq!(cells.len(), 1, "expected exactly one cell");
    let cell = &cells[0];
    let synced = &cell.refined.tuned.synced;

    assert_eq!(cell.n_id_cell(), N_ID_CELL);
    assert_eq!(synced.cp_type, CpType::Normal);
    assert_eq!(synced.duplex_mode, DuplexMode::Fdd);
    assert_eq!(cell.n_ports, 2);
    assert_eq!(cell.bandwidth, DlBandwidth::Rb25);
    assert_eq!(cell.phich_duration, PhichDuration::Normal);
    assert_eq!(cell.phich_resource, PhichResource::One);
    assert_eq!(cell.sfn, SFN0);

    // No frequency offset was applied; both refinement stages should
    // land near zero.
    assert!(cell.refined.tuned.freq_fine.abs() < 100.0);
    assert!(cell.refined.freq_superfine.abs() < 100.0);
}
