//! Capture Buffer I/O
//!
//! A capture is a fixed-length block of baseband IQ samples at the 1.92 MHz
//! search rate, together with the tuning metadata needed to undo hardware
//! frequency and sample-rate error later in the pipeline. Captures can be
//! saved to and replayed from `.bin` files so that searches are repeatable
//! offline.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use num_complex::Complex64;
use tracing::debug;

/// Number of IQ samples in one capture: 80 ms at 1.92 Msps.
pub const CAPLENGTH: usize = 153_600;

#[derive(thiserror::Error, Debug)]
pub enum CaptureError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Capture file truncated: expected {expected} samples, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("Invalid capture metadata: {0}")]
    InvalidMetadata(String),
}

/// One capture worth of baseband samples plus tuning metadata.
///
/// `fc_requested`/`fc_programmed` and `fs_requested`/`fs_programmed` record
/// what was asked of the radio versus what its synthesizer actually
/// produced; the search pipeline uses the ratio to correct sample timing.
#[derive(Debug, Clone)]
pub struct CaptureBuffer {
    pub samples: Vec<Complex64>,
    pub fc_requested: f64,
    pub fc_programmed: f64,
    pub fs_requested: f64,
    pub fs_programmed: f64,
}

impl CaptureBuffer {
    pub fn new(
        samples: Vec<Complex64>,
        fc_requested: f64,
        fc_programmed: f64,
        fs_requested: f64,
        fs_programmed: f64,
    ) -> Result<Self, CaptureError> {
        if fc_programmed <= 0.0 || fs_programmed <= 0.0 {
            return Err(CaptureError::InvalidMetadata(format!(
                "programmed frequencies must be positive (fc={fc_programmed}, fs={fs_programmed})"
            )));
        }
        Ok(Self {
            samples,
            fc_requested,
            fc_programmed,
            fs_requested,
            fs_programmed,
        })
    }

    /// Load a capture from a `.bin` file.
    ///
    /// Layout: four little-endian f64 header values (fc_requested,
    /// fc_programmed, fs_requested, fs_programmed) followed by interleaved
    /// little-endian f32 I/Q pairs.
    pub fn load(path: &Path) -> Result<Self, CaptureError> {
        let mut reader = BufReader::new(File::open(path)?);

        let mut header = [0u8; 32];
        reader.read_exact(&mut header)?;
        let field = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&header[i * 8..(i + 1) * 8]);
            f64::from_le_bytes(b)
        };
        let fc_requested = field(0);
        let fc_programmed = field(1);
        let fs_requested = field(2);
        let fs_programmed = field(3);

        let mut raw = Vec::new();
        reader.read_to_end(&mut raw)?;
        if raw.len() % 8 != 0 {
            return Err(CaptureError::InvalidMetadata(format!(
                "sample payload of {} bytes is not a whole number of IQ pairs",
                raw.len()
            )));
        }
        let n = raw.len() / 8;
        if n < CAPLENGTH {
            return Err(CaptureError::Truncated {
                expected: CAPLENGTH,
                found: n,
            });
        }
        let mut samples = Vec::with_capacity(n);
        for pair in raw.chunks_exact(8) {
            let re = f32::from_le_bytes([pair[0], pair[1], pair[2], pair[3]]);
            let im = f32::from_le_bytes([pair[4], pair[5], pair[6], pair[7]]);
            samples.push(Complex64::new(re as f64, im as f64));
        }

        debug!(
            path = %path.display(),
            n_samples = samples.len(),
            fc_requested,
            fs_programmed,
            "Loaded capture"
        );
        Self::new(samples, fc_requested, fc_programmed, fs_requested, fs_programmed)
    }

    /// Save the capture to a `.bin` file in the same layout as [`Self::load`].
    pub fn save(&self, path: &Path) -> Result<(), CaptureError> {
        let mut writer = BufWriter::new(File::create(path)?);
        for v in [
            self.fc_requested,
            self.fc_programmed,
            self.fs_requested,
            self.fs_programmed,
        ] {
            writer.write_all(&v.to_le_bytes())?;
        }
        for s in &self.samples {
            writer.write_all(&(s.re as f32).to_le_bytes())?;
            writer.write_all(&(s.im as f32).to_le_bytes())?;
        }
        writer.flush()?;
        debug!(path = %path.display(), n_samples = self.samples.len(), "Saved capture");
        Ok(())
    }
}
