//! Cell Hypothesis Types
//!
//! The cell hypothesis is modeled as a typed stage progression: each
//! pipeline stage consumes the previous stage's type and returns a richer
//! one, so "which fields are present" is checked statically. Stages never
//! mutate fields introduced by earlier stages; the frequency-dependent
//! sampling correction factor (k-factor) is recomputed per stage from the
//! best frequency estimate available at that stage.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use serde::Serialize;

/// Cyclic prefix type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CpType {
    Normal,
    Extended,
}

impl CpType {
    /// Number of OFDM symbols per downlink slot
    pub fn n_symb_dl(&self) -> usize {
        match self {
            CpType::Normal => 7,
            CpType::Extended => 6,
        }
    }
}

/// Duplex mode of the detected cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DuplexMode {
    /// Paired spectrum (FDD)
    Fdd,
    /// Unpaired spectrum (TDD)
    Tdd,
}

/// PHICH duration as signaled in the MIB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PhichDuration {
    Normal,
    Extended,
}

/// PHICH resource (Ng) as signaled in the MIB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, FromPrimitive)]
pub enum PhichResource {
    OneSixth,
    Half,
    One,
    Two,
}

impl PhichResource {
    /// Decode the 2-bit MIB codepoint
    pub fn from_codepoint(bits: u8) -> Option<Self> {
        Self::from_u8(bits)
    }
}

/// Downlink bandwidth as signaled in the MIB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, FromPrimitive)]
pub enum DlBandwidth {
    Rb6,
    Rb15,
    Rb25,
    Rb50,
    Rb75,
    Rb100,
}

impl DlBandwidth {
    /// Decode the 3-bit MIB codepoint; undefined codepoints are rejected.
    pub fn from_codepoint(bits: u8) -> Option<Self> {
        Self::from_u8(bits)
    }

    /// Bandwidth in downlink resource blocks
    pub fn n_rb_dl(&self) -> u16 {
        match self {
            DlBandwidth::Rb6 => 6,
            DlBandwidth::Rb15 => 15,
            DlBandwidth::Rb25 => 25,
            DlBandwidth::Rb50 => 50,
            DlBandwidth::Rb75 => 75,
            DlBandwidth::Rb100 => 100,
        }
    }
}

/// Output of the PSS peak detector: one candidate per accepted peak.
#[derive(Debug, Clone, Serialize)]
pub struct CellCandidate {
    /// PSS sequence index (0-2)
    pub n_id_2: u8,
    /// Sample index of the strongest correlation tap
    pub peak_index: f64,
    /// Coarse frequency offset from the search grid, Hz
    pub freq: f64,
    /// Combined correlation power at the peak
    pub pss_pow: f64,
    /// Center frequency the capture was requested at, Hz
    pub fc_requested: f64,
    /// Center frequency the hardware actually tuned to, Hz
    pub fc_programmed: f64,
    /// Sample rate the hardware was programmed to, Hz
    pub fs_programmed: f64,
}

impl CellCandidate {
    /// Sampling correction factor from the coarse frequency estimate
    pub fn k_factor(&self) -> f64 {
        (self.fc_requested - self.freq) / self.fc_programmed
    }
}

/// Candidate enriched by SSS detection: group identity, CP type and
/// frame timing are now known.
#[derive(Debug, Clone, Serialize)]
pub struct SyncedCell {
    pub candidate: CellCandidate,
    /// Cell identity group (0-167)
    pub n_id_1: u16,
    pub cp_type: CpType,
    /// Frame start in (fractional) capture sample time
    pub frame_start: f64,
    pub duplex_mode: DuplexMode,
    /// Winning SSS log-likelihood, for reporting
    pub sss_log_lik: f64,
}

impl SyncedCell {
    /// Composite physical cell identity
    pub fn n_id_cell(&self) -> u16 {
        3 * self.n_id_1 + self.candidate.n_id_2 as u16
    }

    /// Number of OFDM symbols per downlink slot
    pub fn n_symb_dl(&self) -> usize {
        self.cp_type.n_symb_dl()
    }

    /// Sampling correction factor, still based on the coarse estimate
    pub fn k_factor(&self) -> f64 {
        self.candidate.k_factor()
    }
}

/// Cell with a fine frequency estimate from PSS/SSS phase comparison.
#[derive(Debug, Clone, Serialize)]
pub struct TunedCell {
    pub synced: SyncedCell,
    /// Fine frequency offset estimate, Hz
    pub freq_fine: f64,
}

impl TunedCell {
    /// Sampling correction factor from the fine frequency estimate
    pub fn k_factor(&self) -> f64 {
        (self.synced.candidate.fc_requested - self.freq_fine) / self.synced.candidate.fc_programmed
    }

    pub fn n_id_cell(&self) -> u16 {
        self.synced.n_id_cell()
    }

    pub fn n_symb_dl(&self) -> usize {
        self.synced.n_symb_dl()
    }
}

/// Cell after superfine frequency/timing refinement on the resource grid.
#[derive(Debug, Clone, Serialize)]
pub struct RefinedCell {
    pub tuned: TunedCell,
    /// Superfine frequency offset estimate, Hz
    pub freq_superfine: f64,
}

impl RefinedCell {
    pub fn n_id_cell(&self) -> u16 {
        self.tuned.n_id_cell()
    }

    pub fn n_symb_dl(&self) -> usize {
        self.tuned.n_symb_dl()
    }

    pub fn cp_type(&self) -> CpType {
        self.tuned.synced.cp_type
    }
}

/// Terminal stage: the MIB was decoded and the system parameters are known.
#[derive(Debug, Clone, Serialize)]
pub struct DecodedCell {
    pub refined: RefinedCell,
    /// Number of transmit antenna ports (1, 2 or 4)
    pub n_ports: u8,
    pub bandwidth: DlBandwidth,
    pub phich_duration: PhichDuration,
    pub phich_resource: PhichResource,
    /// System frame number (0-1023)
    pub sfn: u16,
}

impl DecodedCell {
    pub fn n_id_cell(&self) -> u16 {
        self.refined.n_id_cell()
    }
}
