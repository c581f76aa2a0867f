//! Per-file error taxonomy for the dewarping pipeline.

use std::path::PathBuf;

/// Everything that can end processing of a single photo.
///
/// All of these are reported at file granularity; none of them aborts the
/// batch.
#[derive(Debug, thiserror::Error)]
pub enum DewarpError {
    /// The calibration tag is absent from the image metadata.
    #[error("no dewarp calibration record in metadata")]
    MissingCalibration,

    /// The calibration tag is present but its payload does not parse.
    #[error("invalid dewarp calibration record: {0}")]
    InvalidCalibration(String),

    /// The already-processed flag is set; the file is skipped, not failed.
    #[error("image is already dewarped")]
    AlreadyProcessed,

    /// The undistortion map was built for a different resolution.
    #[error("map is {map_width}x{map_height} but image is {image_width}x{image_height}")]
    DimensionMismatch {
        map_width: u32,
        map_height: u32,
        image_width: u32,
        image_height: u32,
    },

    #[error("failed to read {path}: {source}")]
    FileReadFailed {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to write {path}: {source}")]
    FileWriteFailed {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// exiftool ran but did not confirm the tag copy.
    #[error("metadata copy failed: {0}")]
    MetadataCopyFailed(String),

    /// exiftool did not answer within the configured bound.
    #[error("exiftool did not respond within {seconds}s")]
    MetadataTimeout { seconds: u64 },

    /// Transport-level failure talking to the exiftool process.
    #[error("exiftool session error: {0}")]
    Session(#[from] std::io::Error),
}

impl DewarpError {
    /// True for outcomes that are legitimate skips rather than failures.
    pub fn is_skip(&self) -> bool {
        matches!(self, DewarpError::AlreadyProcessed)
    }
}
