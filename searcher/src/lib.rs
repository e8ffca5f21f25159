//! LTE Downlink Cell Searcher Library
//!
//! Blind acquisition of LTE cells from a baseband capture decimated to
//! 1.92 Msps: PSS cross-correlation across a frequency hypothesis grid,
//! SSS detection with cyclic prefix resolution, two stages of fine
//! frequency and timing estimation, resource grid extraction, channel
//! estimation and blind MIB decoding.

pub mod chan_est;
pub mod coding;
pub mod constants;
pub mod mib;
pub mod pss;
pub mod rs;
pub mod sss;
pub mod sync;
pub mod tfg;

use capture::CaptureBuffer;
use common::types::{DecodedCell, DuplexMode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Subcarriers spanned by the central six resource blocks
pub const N_SC_GRID: usize = 72;

/// Cell search errors
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("capture too short: need {needed} samples, got {got}")]
    CaptureTooShort { needed: usize, got: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Capture(#[from] capture::CaptureError),
}

/// Tunable cell search parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Delay-spread combining arm, in samples to each side
    pub ds_comb_arm: usize,
    /// Noise quantile (in standard normal units) for the detection
    /// threshold of the combined correlation power
    pub threshold_quantile: f64,
    /// Suppression margin below a peak for the other root sequences, dB.
    /// Together with the repetition floor this must leave no band where
    /// cross-correlation leakage near a peak can survive both checks.
    pub cross_seq_margin_db: f64,
    /// Global floor below the strongest peak, dB
    pub repetition_floor_db: f64,
    /// Significance margin of the best SSS hypothesis, in standard
    /// deviations over the full hypothesis population
    pub sss_n_sigma: f64,
    /// Frequency search span to each side of the carrier, Hz
    pub freq_span: f64,
    /// Frequency search step, Hz
    pub freq_step: f64,
}

impl SearchConfig {
    /// Reject out-of-range parameters; configuration comes from files
    /// and CLI flags, so nothing here can be assumed valid.
    pub fn validate(&self) -> Result<(), SearchError> {
        if !(self.freq_step > 0.0) || !self.freq_step.is_finite() {
            return Err(SearchError::InvalidConfig(format!(
                "freq_step must be positive and finite, got {}",
                self.freq_step
            )));
        }
        if !(self.freq_span >= 0.0) || !self.freq_span.is_finite() {
            return Err(SearchError::InvalidConfig(format!(
                "freq_span must be non-negative and finite, got {}",
                self.freq_span
            )));
        }
        Ok(())
    }

    /// Frequency hypothesis grid defined by span and step.
    pub fn f_search_set(&self) -> Result<Vec<f64>, SearchError> {
        self.validate()?;
        let mut set = Vec::new();
        let mut f = -self.freq_span;
        while f <= self.freq_span + 1e-9 {
            set.push(f);
            f += self.freq_step;
        }
        Ok(set)
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            ds_comb_arm: 2,
            threshold_quantile: 4.7534,
            cross_seq_margin_db: 12.0,
            repetition_floor_db: 12.0,
            sss_n_sigma: 3.0,
            freq_span: 50_000.0,
            freq_step: 5_000.0,
        }
    }
}

/// Run the full search pipeline over one capture.
///
/// Every PSS candidate is taken through SSS detection (FDD first, then
/// TDD), frequency refinement, grid extraction and MIB decoding; stage
/// failures drop the candidate rather than abort the search.
pub fn search_cells(
    capture: &CaptureBuffer,
    f_search_set: &[f64],
    config: &SearchConfig,
) -> Result<Vec<DecodedCell>, SearchError> {
    let surface = pss::xcorr_pss(capture, f_search_set, config)?;
    let candidates = pss::peak_search(&surface, f_search_set, capture, config);
    info!(n_candidates = candidates.len(), "PSS search complete");

    let mut cells = Vec::new();
    for cand in &candidates {
        let mut synced = None;
        for duplex_mode in [DuplexMode::Fdd, DuplexMode::Tdd] {
            match sss::sss_detect(cand, capture, duplex_mode, config) {
                Ok(Some(s)) => {
                    synced = Some(s);
                    break;
                }
                Ok(None) => {}
                Err(e) => debug!(n_id_2 = cand.n_id_2, %e, "SSS detection failed"),
            }
        }
        let Some(synced) = synced else {
            debug!(
                n_id_2 = cand.n_id_2,
                peak_index = cand.peak_index,
                "no significant SSS, dropping candidate"
            );
            continue;
        };
        info!(
            n_id_cell = synced.n_id_cell(),
            ?synced.duplex_mode,
            ?synced.cp_type,
            "cell synchronized"
        );

        let tuned = match sync::pss_sss_foe(&synced, capture) {
            Ok(t) => t,
            Err(e) => {
                debug!(n_id_cell = synced.n_id_cell(), %e, "fine FOE failed");
                continue;
            }
        };
        let (mut grid, mut timestamps) = match tfg::extract_tfg(&tuned, capture) {
            Ok(g) => g,
            Err(e) => {
                debug!(n_id_cell = tuned.n_id_cell(), %e, "grid extraction failed");
                continue;
            }
        };
        let rs_dl = rs::RsDl::new(tuned.n_id_cell(), tuned.synced.cp_type);
        let refined = sync::tfoec(&tuned, &mut grid, &mut timestamps, &rs_dl);

        match mib::decode_mib(&refined, &grid, &rs_dl) {
            Some(cell) => {
                info!(
                    n_id_cell = cell.n_id_cell(),
                    n_ports = cell.n_ports,
                    sfn = cell.sfn,
                    ?cell.bandwidth,
                    "MIB decoded"
                );
                cells.push(cell);
            }
            None => {
                debug!(n_id_cell = refined.n_id_cell(), "MIB decode failed");
            }
        }
    }
    Ok(cells)
}
