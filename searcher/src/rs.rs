//! Cell-Specific Reference Signals
//!
//! Downlink reference signal sequences and their frequency shifts per
//! 3GPP TS 36.211 Section 6.10.1, restricted to the six center resource
//! blocks the search pipeline works with.

use crate::coding::pn_sequence;
use common::types::CpType;
use num_complex::Complex64;
use std::f64::consts::FRAC_1_SQRT_2;

/// Reference signals per RS-bearing OFDM symbol in the 72-subcarrier grid
pub const N_RS: usize = 12;

/// Largest downlink bandwidth in resource blocks, which anchors the
/// sequence indexing for narrower grids.
const N_RB_MAX: usize = 110;

/// Reference-signal sequences for one cell identity, precomputed for every
/// slot and every RS-bearing symbol.
pub struct RsDl {
    n_id_cell: u16,
    cp_type: CpType,
    // Indexed [slot][symbol]; None for symbols that never carry RS.
    table: Vec<Vec<Option<[Complex64; N_RS]>>>,
}

impl RsDl {
    pub fn new(n_id_cell: u16, cp_type: CpType) -> Self {
        let n_symb = cp_type.n_symb_dl();
        let n_cp = match cp_type {
            CpType::Normal => 1u32,
            CpType::Extended => 0u32,
        };
        let mut table = Vec::with_capacity(20);
        for ns in 0..20u32 {
            let mut row = vec![None; n_symb];
            for l in [0usize, 1, n_symb - 3] {
                let c_init = (1 << 10) * (7 * (ns + 1) + l as u32 + 1) * (2 * n_id_cell as u32 + 1)
                    + 2 * n_id_cell as u32
                    + n_cp;
                let c = pn_sequence(c_init, 4 * N_RB_MAX);
                let mut seq = [Complex64::default(); N_RS];
                for (m, v) in seq.iter_mut().enumerate() {
                    // The six center RBs sit in the middle of the maximum
                    // bandwidth the sequence is defined over.
                    let mp = m + N_RB_MAX - 6;
                    *v = Complex64::new(
                        FRAC_1_SQRT_2 * (1.0 - 2.0 * c[2 * mp] as f64),
                        FRAC_1_SQRT_2 * (1.0 - 2.0 * c[2 * mp + 1] as f64),
                    );
                }
                row[l] = Some(seq);
            }
            table.push(row);
        }
        Self {
            n_id_cell,
            cp_type,
            table,
        }
    }

    /// Reference sequence for slot `ns` and symbol `l`; `None` for symbols
    /// with no reference signals.
    pub fn get_rs(&self, ns: usize, l: usize) -> Option<&[Complex64; N_RS]> {
        self.table[ns % 20][l].as_ref()
    }

    /// Subcarrier offset of the first reference signal in slot `ns`,
    /// symbol `l`, for the given antenna port.
    pub fn get_shift(&self, ns: usize, l: usize, port: u8) -> usize {
        let v = match port {
            0 => {
                if l == 0 {
                    0
                } else {
                    3
                }
            }
            1 => {
                if l == 0 {
                    3
                } else {
                    0
                }
            }
            2 => 3 * (ns % 2),
            _ => 3 + 3 * (ns % 2),
        };
        (v + self.n_id_cell as usize) % 6
    }

    pub fn cp_type(&self) -> CpType {
        self.cp_type
    }

    /// Symbols within a slot that carry reference signals for ports 0/1
    pub fn rs_symbols(&self) -> [usize; 2] {
        [0, self.cp_type.n_symb_dl() - 3]
    }
}
