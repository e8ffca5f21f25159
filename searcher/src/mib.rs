//! Blind MIB Decoding
//!
//! The broadcast channel repeats one coded block over four consecutive
//! frames, and neither the 40 ms alignment nor the transmit diversity
//! order is known in advance. The decoder estimates the channel for all
//! four possible ports, then tries every alignment offset and every port
//! count (1, 2, 4), stopping at the first hypothesis whose CRC matches
//! after the port-count-specific mask.

use crate::chan_est::{chan_est, PortChannel};
use crate::coding::{conv_decode, pn_sequence, qpsk_demodulate, rate_unmatch};
use crate::rs::RsDl;
use crate::N_SC_GRID;
use common::types::{CpType, DecodedCell, DlBandwidth, PhichDuration, PhichResource, RefinedCell};
use common::utils::{crc16, pack_bits};
use ndarray::{s, Array2, ArrayView2};
use num_complex::Complex64;
use rayon::prelude::*;
use tracing::debug;

/// Broadcast channel coded length in bits
pub fn pbch_m_bit(cp_type: CpType) -> usize {
    match cp_type {
        CpType::Normal => 1920,
        CpType::Extended => 1728,
    }
}

/// Collect the broadcast channel resource elements of four consecutive
/// frames, together with the channel estimate of every port at each RE.
///
/// Positions that could carry reference signals for any port are skipped,
/// whether or not this cell transmits on that port.
pub(crate) fn pbch_extract(
    n_id_cell: u16,
    cp_type: CpType,
    tfg: &ArrayView2<Complex64>,
    ce: &[ArrayView2<Complex64>; 4],
) -> (Vec<Complex64>, Array2<Complex64>) {
    let n_symb_dl = cp_type.n_symb_dl();
    let m_bit = pbch_m_bit(cp_type);
    let v_shift_m3 = (n_id_cell % 3) as usize;

    let mut pbch_sym = Vec::with_capacity(m_bit / 2);
    let mut pbch_ce = Array2::<Complex64>::zeros((4, m_bit / 2));
    let mut idx = 0usize;
    for fr in 0..4 {
        for sym in 0..4usize {
            for sc in 0..N_SC_GRID {
                if sc % 3 == v_shift_m3
                    && (sym == 0 || sym == 1 || (sym == 3 && n_symb_dl == 6))
                {
                    continue;
                }
                let row = fr * 10 * 2 * n_symb_dl + n_symb_dl + sym;
                pbch_sym.push(tfg[(row, sc)]);
                for p in 0..4 {
                    pbch_ce[(p, idx)] = ce[p][(row, sc)];
                }
                idx += 1;
            }
        }
    }
    debug_assert_eq!(idx, m_bit / 2);
    (pbch_sym, pbch_ce)
}

/// Channel-compensate the broadcast symbols for a given port count,
/// returning the equalized symbols and their per-symbol noise power.
fn equalize(
    n_ports: u8,
    pbch_sym: &[Complex64],
    pbch_ce: &Array2<Complex64>,
    np_v: &[f64; 4],
) -> (Vec<Complex64>, Vec<f64>) {
    let n = pbch_sym.len();
    let mut syms = vec![Complex64::default(); n];
    let mut np = vec![0.0f64; n];
    if n_ports == 1 {
        for t in 0..n {
            let h = pbch_ce[(0, t)];
            let gain = h.conj() / h.norm_sqr();
            syms[t] = pbch_sym[t] * gain;
            np[t] = np_v[0] * gain.norm_sqr();
        }
    } else {
        for t in (0..n).step_by(2) {
            // Zero-forcing combination of the space-frequency block code.
            let (h1, h2, np_temp) = if n_ports == 2 {
                (
                    (pbch_ce[(0, t)] + pbch_ce[(0, t + 1)]) / 2.0,
                    (pbch_ce[(1, t)] + pbch_ce[(1, t + 1)]) / 2.0,
                    (np_v[0] + np_v[1]) / 2.0,
                )
            } else if t % 4 == 0 {
                (
                    (pbch_ce[(0, t)] + pbch_ce[(0, t + 1)]) / 2.0,
                    (pbch_ce[(2, t)] + pbch_ce[(2, t + 1)]) / 2.0,
                    (np_v[0] + np_v[2]) / 2.0,
                )
            } else {
                (
                    (pbch_ce[(1, t)] + pbch_ce[(1, t + 1)]) / 2.0,
                    (pbch_ce[(3, t)] + pbch_ce[(3, t + 1)]) / 2.0,
                    (np_v[1] + np_v[3]) / 2.0,
                )
            };
            let x1 = pbch_sym[t];
            let x2 = pbch_sym[t + 1];
            let scale = h1.norm_sqr() + h2.norm_sqr();
            syms[t] = (h1.conj() * x1 + h2 * x2.conj()) / scale;
            syms[t + 1] = ((-h2.conj() * x1 + h1 * x2.conj()) / scale).conj();
            np[t] = ((h1.norm() / scale).powi(2) + (h2.norm() / scale).powi(2)) * np_temp;
            np[t + 1] = np[t];
        }
        // Transmit diversity precoding costs 3 dB per symbol.
        for s in syms.iter_mut() {
            *s *= std::f64::consts::SQRT_2;
        }
    }
    (syms, np)
}

/// CRC mask distinguishing the transmit diversity order.
fn crc_mask(n_ports: u8) -> u16 {
    match n_ports {
        1 => 0x0000,
        2 => 0xffff,
        _ => 0x5555,
    }
}

/// Blindly decode the MIB across frame alignments and port counts.
///
/// Returns `None` when all twelve hypotheses fail the CRC, or when a
/// passing hypothesis carries an undefined configuration codepoint.
pub fn decode_mib(
    refined: &RefinedCell,
    tfg: &Array2<Complex64>,
    rs_dl: &RsDl,
) -> Option<DecodedCell> {
    let n_symb_dl = refined.n_symb_dl();
    let n_id_cell = refined.n_id_cell();
    let cp_type = refined.cp_type();

    // Channel estimation for all four candidate ports; independent tasks.
    let ports: Vec<PortChannel> = (0..4u8)
        .into_par_iter()
        .map(|p| chan_est(rs_dl, tfg, p))
        .collect();
    let np_v = [ports[0].np, ports[1].np, ports[2].np, ports[3].np];

    for frame_timing_guess in 0..4usize {
        let start = frame_timing_guess * 10 * 2 * n_symb_dl;
        let end = start + 3 * 10 * 2 * n_symb_dl + 2 * n_symb_dl;
        let tfg_try = tfg.slice(s![start..end, ..]);
        let ce_try = [
            ports[0].ce.slice(s![start..end, ..]),
            ports[1].ce.slice(s![start..end, ..]),
            ports[2].ce.slice(s![start..end, ..]),
            ports[3].ce.slice(s![start..end, ..]),
        ];
        let (pbch_sym, pbch_ce) = pbch_extract(n_id_cell, cp_type, &tfg_try, &ce_try);

        for n_ports in [1u8, 2, 4] {
            let (syms, np) = equalize(n_ports, &pbch_sym, &pbch_ce, &np_v);

            let mut soft = qpsk_demodulate(&syms, &np);
            let scr = pn_sequence(n_id_cell as u32, soft.len());
            for (v, &c) in soft.iter_mut().zip(scr.iter()) {
                if c == 1 {
                    *v = -*v;
                }
            }
            let c_est = conv_decode(&rate_unmatch(&soft, 40));

            let crc_calc = crc16(&c_est[..24]) ^ crc_mask(n_ports);
            let crc_rx = pack_bits(&c_est[24..40]) as u16;
            if crc_calc != crc_rx {
                continue;
            }

            let Some(bandwidth) = DlBandwidth::from_codepoint(pack_bits(&c_est[0..3]) as u8)
            else {
                debug!(frame_timing_guess, n_ports, "undefined bandwidth codepoint");
                continue;
            };
            let phich_duration = if c_est[3] == 1 {
                PhichDuration::Extended
            } else {
                PhichDuration::Normal
            };
            // Two-bit field; every codepoint is defined.
            let phich_resource = PhichResource::from_codepoint(pack_bits(&c_est[4..6]) as u8)?;
            let sfn_field = pack_bits(&c_est[6..14]);
            let sfn = ((sfn_field * 4 + 1024 - frame_timing_guess as u32) % 1024) as u16;

            debug!(
                n_id_cell,
                n_ports,
                frame_timing_guess,
                sfn,
                "MIB decoded"
            );
            return Some(DecodedCell {
                refined: refined.clone(),
                n_ports,
                bandwidth,
                phich_duration,
                phich_resource,
                sfn,
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chan_est::rs_rows;
    use crate::coding::{conv_encode, qpsk_modulate, rate_match};
    use crate::tfg::n_ofdm_sym;
    use common::types::{CellCandidate, DuplexMode, SyncedCell, TunedCell};
    use common::utils::unpack_bits;

    const N_ID_CELL: u16 = 16; // group 5, sequence 1

    fn refined_cell(cp_type: CpType) -> RefinedCell {
        RefinedCell {
            tuned: TunedCell {
                synced: SyncedCell {
                    candidate: CellCandidate {
                        n_id_2: (N_ID_CELL % 3) as u8,
                        peak_index: 0.0,
                        freq: 0.0,
                        pss_pow: 1.0,
                        fc_requested: 739e6,
                        fc_programmed: 739e6,
                        fs_programmed: 1.92e6,
                    },
                    n_id_1: N_ID_CELL / 3,
                    cp_type,
                    frame_start: 0.0,
                    duplex_mode: DuplexMode::Fdd,
                    sss_log_lik: 0.0,
                },
                freq_fine: 0.0,
            },
            freq_superfine: 0.0,
        }
    }

    // Encode a MIB payload into broadcast channel QPSK symbols.
    fn encode_pbch(
        n_id_cell: u16,
        n_ports: u8,
        bw: u8,
        sfn_field: u32,
        m_bit: usize,
    ) -> Vec<Complex64> {
        let mut bits = Vec::with_capacity(24);
        bits.extend(unpack_bits(bw as u32, 3));
        bits.push(0); // PHICH duration: normal
        bits.extend(unpack_bits(2, 2)); // PHICH resource: one
        bits.extend(unpack_bits(sfn_field, 8));
        bits.extend(std::iter::repeat(0).take(10));
        let crc = crc16(&bits) ^ crc_mask(n_ports);
        bits.extend(unpack_bits(crc as u32, 16));

        let streams = conv_encode(&bits);
        let mut e = rate_match(&streams, m_bit);
        let scr = pn_sequence(n_id_cell as u32, m_bit);
        for (b, &c) in e.iter_mut().zip(scr.iter()) {
            *b ^= c;
        }
        qpsk_modulate(&e)
    }

    // Build a full grid carrying pilots for the active ports (flat unit
    // channels) and the encoded broadcast symbols in frames
    // guess..guess+3.
    fn build_grid(rs_dl: &RsDl, n_ports: u8, guess: usize, sfn_field: u32) -> Array2<Complex64> {
        let cp_type = rs_dl.cp_type();
        let n_symb = cp_type.n_symb_dl();
        let n_ofdm = n_ofdm_sym(n_symb);
        let mut tfg = Array2::<Complex64>::zeros((n_ofdm, N_SC_GRID));

        for port in 0..n_ports {
            for &row in rs_rows(n_symb, n_ofdm, port).iter() {
                let slot = (row / n_symb) % 20;
                let sym = row % n_symb;
                let sh = rs_dl.get_shift(slot, sym, port);
                let rs = rs_dl.get_rs(slot, sym).unwrap();
                for (i, &r) in rs.iter().enumerate() {
                    tfg[(row, sh + 6 * i)] = r;
                }
            }
        }

        let m_bit = pbch_m_bit(cp_type);
        let syms = encode_pbch(N_ID_CELL, n_ports, 2, sfn_field, m_bit);
        let v_shift_m3 = (N_ID_CELL % 3) as usize;
        let mut idx = 0usize;
        for fr in 0..4 {
            for sym in 0..4usize {
                for sc in 0..N_SC_GRID {
                    if sc % 3 == v_shift_m3
                        && (sym == 0 || sym == 1 || (sym == 3 && n_symb == 6))
                    {
                        continue;
                    }
                    let row = (guess + fr) * 10 * 2 * n_symb + n_symb + sym;
                    if n_ports == 1 {
                        tfg[(row, sc)] = syms[idx];
                    } else if idx % 2 == 0 {
                        // Unit channels on both diversity ports; the pair
                        // superposes to (a - b*, b + a*) / sqrt(2).
                        let a = syms[idx];
                        let b = syms[idx + 1];
                        tfg[(row, sc)] = (a - b.conj()) / std::f64::consts::SQRT_2;
                    } else {
                        let a = syms[idx - 1];
                        let b = syms[idx];
                        tfg[(row, sc)] = (b + a.conj()) / std::f64::consts::SQRT_2;
                    }
                    idx += 1;
                }
            }
        }
        assert_eq!(idx, m_bit / 2);
        tfg
    }

    #[test]
    fn test_mib_roundtrip_all_ports_and_alignments() {
        let rs_dl = RsDl::new(N_ID_CELL, CpType::Normal);
        let refined = refined_cell(CpType::Normal);
        for n_ports in [1u8, 2, 4] {
            for guess in 0..4usize {
                let sfn_field = 40 + guess as u32;
                let tfg = build_grid(&rs_dl, n_ports, guess, sfn_field);
                let decoded = decode_mib(&refined, &tfg, &rs_dl)
                    .unwrap_or_else(|| panic!("MIB not found: ports {n_ports} guess {guess}"));
                assert_eq!(decoded.n_ports, n_ports, "guess {guess}");
                assert_eq!(decoded.bandwidth, DlBandwidth::Rb25);
                assert_eq!(decoded.phich_duration, PhichDuration::Normal);
                assert_eq!(decoded.phich_resource, PhichResource::One);
                let expect_sfn = ((sfn_field * 4 + 1024 - guess as u32) % 1024) as u16;
                assert_eq!(decoded.sfn, expect_sfn, "guess {guess}");
            }
        }
    }

    #[test]
    fn test_mib_roundtrip_extended_cp() {
        let rs_dl = RsDl::new(N_ID_CELL, CpType::Extended);
        let refined = refined_cell(CpType::Extended);
        let (n_ports, guess, sfn_field) = (2u8, 1usize, 77u32);
        let tfg = build_grid(&rs_dl, n_ports, guess, sfn_field);
        let decoded = decode_mib(&refined, &tfg, &rs_dl).expect("MIB not found");
        assert_eq!(decoded.n_ports, n_ports);
        assert_eq!(decoded.bandwidth, DlBandwidth::Rb25);
        assert_eq!(decoded.sfn, ((sfn_field * 4 + 1024 - guess as u32) % 1024) as u16);
    }

    #[test]
    fn test_empty_grid_rejected() {
        let rs_dl = RsDl::new(N_ID_CELL, CpType::Normal);
        let refined = refined_cell(CpType::Normal);
        let n_ofdm = n_ofdm_sym(7);
        let tfg = Array2::from_elem((n_ofdm, N_SC_GRID), Complex64::new(1e-3, -1e-3));
        assert!(decode_mib(&refined, &tfg, &rs_dl).is_none());
    }
}
