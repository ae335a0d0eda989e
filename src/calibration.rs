//! # Calibration Store
//!
//! Holds the two calibration scalars (leeway factor K and wind vane offset),
//! validates changes and persists them to `/calibration.json`.
//!
//! ## File Format
//! ```json
//! {"version":1,"leewayKFactor":0.75,"windAngleOffset":0.087,"lastModified":1760601600}
//! ```
//!
//! ## Atomic Replace
//! `save` writes the complete document to `/calibration.json.tmp` and renames
//! it over the real file. A crash at any point leaves either the previous or
//! the new document on disk, never a mix. The in-memory values change only
//! after the rename succeeded.

use std::f64::consts::TAU;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::boat_data::CalibrationParameters;
use crate::hal::FileSystem;

pub const CALIBRATION_PATH: &str = "/calibration.json";
const TEMP_PATH: &str = "/calibration.json.tmp";
const FILE_VERSION: u32 = 1;

/// Reasons a calibration change or file operation fails.
#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("leeway factor must be positive, got {0}")]
    InvalidLeewayFactor(f64),

    #[error("wind angle offset must be within ±2π, got {0}")]
    InvalidWindOffset(f64),

    #[error("calibration file IO: {0}")]
    Io(#[from] io::Error),

    #[error("calibration file format: {0}")]
    Format(#[from] serde_json::Error),

    #[error("unsupported calibration file version {0}")]
    Version(u32),
}

/// What `load` found on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Values read and adopted
    Loaded,
    /// No file yet; defaults kept
    Missing,
    /// File present but unusable; defaults kept
    Rejected,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalibrationFile {
    version: u32,
    #[serde(rename = "leewayKFactor")]
    leeway_k_factor: f64,
    wind_angle_offset: f64,
    last_modified: i64,
}

/// Check the calibration invariants: K > 0 and |offset| ≤ 2π.
pub fn validate(leeway_k: f64, wind_angle_offset: f64) -> Result<(), CalibrationError> {
    if !(leeway_k.is_finite() && leeway_k > 0.0) {
        return Err(CalibrationError::InvalidLeewayFactor(leeway_k));
    }
    if !(wind_angle_offset.is_finite() && wind_angle_offset.abs() <= TAU) {
        return Err(CalibrationError::InvalidWindOffset(wind_angle_offset));
    }
    Ok(())
}

/// Validated, persisted calibration parameters.
pub struct CalibrationStore<F: FileSystem> {
    fs: F,
    current: CalibrationParameters,
}

impl<F: FileSystem> CalibrationStore<F> {
    /// A store holding defaults. Call [`load`](Self::load) once the
    /// filesystem is mounted.
    pub fn new(fs: F) -> Self {
        CalibrationStore {
            fs,
            current: CalibrationParameters::default(),
        }
    }

    pub fn get(&self) -> CalibrationParameters {
        self.current
    }

    /// Validate and adopt new values in memory only.
    pub fn set(&mut self, leeway_k: f64, wind_angle_offset: f64) -> Result<(), CalibrationError> {
        validate(leeway_k, wind_angle_offset)?;
        self.adopt(leeway_k, wind_angle_offset);
        Ok(())
    }

    /// Validate, persist atomically, then adopt. On any error the file and
    /// the in-memory values are unchanged.
    pub fn save(&mut self, leeway_k: f64, wind_angle_offset: f64) -> Result<(), CalibrationError> {
        validate(leeway_k, wind_angle_offset)?;
        let document = CalibrationFile {
            version: FILE_VERSION,
            leeway_k_factor: leeway_k,
            wind_angle_offset,
            last_modified: chrono::Utc::now().timestamp(),
        };
        let bytes = serde_json::to_vec(&document)?;

        if let Err(error) = self.fs.write(TEMP_PATH, &bytes) {
            let _ = self.fs.remove(TEMP_PATH);
            return Err(error.into());
        }
        if let Err(error) = self.fs.rename(TEMP_PATH, CALIBRATION_PATH) {
            let _ = self.fs.remove(TEMP_PATH);
            return Err(error.into());
        }

        self.adopt(leeway_k, wind_angle_offset);
        tracing::info!(leeway_k, wind_angle_offset, "calibration saved");
        Ok(())
    }

    /// Read the calibration file. A missing file keeps defaults silently; a
    /// malformed or invalid one keeps defaults with a warning.
    pub fn load(&mut self) -> LoadOutcome {
        if !self.fs.exists(CALIBRATION_PATH) {
            tracing::info!("no calibration file, using defaults");
            return LoadOutcome::Missing;
        }
        match self.read_file() {
            Ok(document) => {
                self.adopt(document.leeway_k_factor, document.wind_angle_offset);
                tracing::info!(
                    leeway_k = document.leeway_k_factor,
                    wind_angle_offset = document.wind_angle_offset,
                    "calibration loaded"
                );
                LoadOutcome::Loaded
            }
            Err(error) => {
                tracing::warn!(%error, "calibration file unusable, using defaults");
                LoadOutcome::Rejected
            }
        }
    }

    fn read_file(&self) -> Result<CalibrationFile, CalibrationError> {
        let bytes = self.fs.read(CALIBRATION_PATH)?;
        let document: CalibrationFile = serde_json::from_slice(&bytes)?;
        if document.version != FILE_VERSION {
            return Err(CalibrationError::Version(document.version));
        }
        validate(document.leeway_k_factor, document.wind_angle_offset)?;
        Ok(document)
    }

    fn adopt(&mut self, leeway_k: f64, wind_angle_offset: f64) {
        self.current = CalibrationParameters {
            leeway_k,
            wind_angle_offset,
            version: self.current.version.wrapping_add(1),
        };
    }

    pub fn filesystem(&self) -> &F {
        &self.fs
    }
}
