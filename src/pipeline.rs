//! Per-file dewarping pipeline and the batch driver around it.
//!
//! Each file runs the full pipeline independently: read calibration from
//! metadata, build the camera model, compute the undistortion map, resample,
//! write, copy metadata onto the output. Files share nothing, so the batch
//! fans out over a rayon worker pool; one file's failure never stops the
//! rest.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use rayon::prelude::*;
use tracing::{error, info, warn};

use crate::calibration::{self, CalibrationRecord};
use crate::camera::CameraModel;
use crate::config::Config;
use crate::error::DewarpError;
use crate::exiftool::ExifTool;
use crate::remap::UndistortionMap;
use crate::resample;

/// Outcome tally for one batch run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub corrected: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Process every matching file in `input_dir`, writing corrected copies to
/// `output_dir`.
pub fn run_batch(
    input_dir: &Path,
    output_dir: &Path,
    config: &Config,
) -> anyhow::Result<BatchSummary> {
    let files = list_candidates(input_dir, &config.batch.extension)?;
    info!(
        "{} file(s) matching *{} in {}",
        files.len(),
        config.batch.extension,
        input_dir.display()
    );

    let outcomes: Vec<(PathBuf, Result<PathBuf, DewarpError>)> = files
        .into_par_iter()
        .map(|path| {
            let result = process_file(&path, output_dir, config);
            (path, result)
        })
        .collect();

    let mut summary = BatchSummary::default();
    for (path, result) in outcomes {
        match result {
            Ok(output) => {
                info!("{} -> {}", path.display(), output.display());
                summary.corrected += 1;
            }
            Err(err) if err.is_skip() => {
                info!("skipped {}: {}", path.display(), err);
                summary.skipped += 1;
            }
            Err(err) => {
                error!("{}: {}", path.display(), err);
                summary.failed += 1;
            }
        }
    }

    Ok(summary)
}

/// Regular files in `dir` whose name ends with `extension`, in directory
/// order. The match is a case-sensitive suffix test on the full file name.
fn list_candidates(dir: &Path, extension: &str) -> anyhow::Result<Vec<PathBuf>> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
            if name.ends_with(extension) {
                files.push(path);
            }
        }
    }
    Ok(files)
}

/// Run the full pipeline for one photo.
fn process_file(
    input: &Path,
    output_dir: &Path,
    config: &Config,
) -> Result<PathBuf, DewarpError> {
    info!("reading {}", input.display());

    let mut session = ExifTool::spawn(&config.exiftool)?;
    let record = extract_calibration(&mut session, input)?;

    let image = image::open(input)
        .map_err(|source| DewarpError::FileReadFailed {
            path: input.to_path_buf(),
            source,
        })?
        .into_rgb8();
    let (width, height) = image.dimensions();

    info!(
        "dewarping {} ({}x{}, calibrated {})",
        input.display(),
        width,
        height,
        record.capture_date
    );

    let model = CameraModel::new(&record, width, height);
    let map = UndistortionMap::compute(&model);
    let corrected = resample::remap(&image, &map)?;

    let output = output_path(input, output_dir, &config.batch.suffix);
    info!("writing {}", output.display());
    corrected
        .save(&output)
        .map_err(|source| DewarpError::FileWriteFailed {
            path: output.clone(),
            source,
        })?;

    copy_metadata(session, config, input, &output)?;

    Ok(output)
}

/// Read the dewarp tags and turn them into a calibration record.
///
/// The flag wins over the record: a flagged file is skipped even when its
/// record would not parse, since it is not going to be processed either way.
fn extract_calibration(
    session: &mut ExifTool,
    input: &Path,
) -> Result<CalibrationRecord, DewarpError> {
    let tags = session.read_dewarp_tags(input)?;

    if let Some(flag) = &tags.dewarp_flag {
        if calibration::flag_is_set(flag) {
            return Err(DewarpError::AlreadyProcessed);
        }
    }

    let payload = tags.dewarp_data.ok_or(DewarpError::MissingCalibration)?;
    CalibrationRecord::parse(&payload)
}

/// Copy the source tag set onto the output, with bounded retries.
///
/// Each retry gets a fresh session: a timeout kills the old one, and a
/// session that produced a transport error is not worth reusing. The
/// already-written image is left in place on final failure.
fn copy_metadata(
    mut session: ExifTool,
    config: &Config,
    input: &Path,
    output: &Path,
) -> Result<(), DewarpError> {
    info!("copying metadata from {}", input.display());

    let mut attempt = 0;
    loop {
        match session.copy_all_tags(input, output) {
            Ok(()) => return Ok(()),
            Err(err) if attempt < config.exiftool.copy_retries => {
                attempt += 1;
                warn!(
                    "metadata copy for {} failed ({}), retry {}/{}",
                    output.display(),
                    err,
                    attempt,
                    config.exiftool.copy_retries
                );
                session = ExifTool::spawn(&config.exiftool)?;
            }
            Err(err) => return Err(err),
        }
    }
}

/// `DJI_0042.JPG` becomes `<output_dir>/DJI_0042_dewarped.JPG`.
fn output_path(input: &Path, output_dir: &Path, suffix: &str) -> PathBuf {
    let name = input
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let out = match name.rsplit_once('.') {
        Some((stem, ext)) => format!("{}{}.{}", stem, suffix, ext),
        None => format!("{}{}", name, suffix),
    };
    output_dir.join(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_naming_inserts_suffix_before_extension() {
        let out = output_path(Path::new("/in/DJI_0042.JPG"), Path::new("/out"), "_dewarped");
        assert_eq!(out, Path::new("/out/DJI_0042_dewarped.JPG"));
    }

    #[test]
    fn output_naming_without_extension_appends_suffix() {
        let out = output_path(Path::new("/in/scan"), Path::new("/out"), "_dewarped");
        assert_eq!(out, Path::new("/out/scan_dewarped"));
    }

    #[test]
    fn output_naming_keeps_only_the_last_extension() {
        let out = output_path(Path::new("/in/a.b.JPG"), Path::new("/out"), "_dewarped");
        assert_eq!(out, Path::new("/out/a.b_dewarped.JPG"));
    }

    #[test]
    fn listing_filters_by_case_sensitive_suffix() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.JPG", "b.jpg", "c.JPG", "notes.txt"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        fs::create_dir(dir.path().join("sub.JPG")).unwrap();

        let mut names: Vec<String> = list_candidates(dir.path(), "JPG")
            .unwrap()
            .into_iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, ["a.JPG", "c.JPG"]);

        let lower = list_candidates(dir.path(), "jpg").unwrap();
        assert_eq!(lower.len(), 1);
    }

    #[test]
    fn listing_a_missing_directory_fails() {
        assert!(list_candidates(Path::new("/definitely/not/here"), "JPG").is_err());
    }
}
