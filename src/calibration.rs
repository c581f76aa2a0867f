//! Extraction of dewarp calibration records from image metadata.
//!
//! DJI drones embed per-shot lens calibration in two XMP tags:
//! `DewarpData` holds `<date>;fx,fy,cx,cy,k1,k2,p1,p2,k3` and `DewarpFlag`
//! is non-zero once an image has already been corrected.
//!
//! Example from a Phantom 4 RTK:
//!
//! ```text
//! Dewarp Data : 2018-09-04;3678.870000000000,3671.840000000000,10.100000000000,...
//! Dewarp Flag : 0
//! ```

use crate::error::DewarpError;

/// Calibration coefficients for one photo, parsed fresh from its metadata.
///
/// A record never outlives the file it was read from; every photo gets its
/// own parse, so a missing tag can never fall back to another file's
/// coefficients.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationRecord {
    /// Calibration date from the tag, informational only.
    pub capture_date: String,
    /// Focal lengths in pixels.
    pub fx: f64,
    pub fy: f64,
    /// Principal-point offsets from the image center, in pixels.
    pub cx: f64,
    pub cy: f64,
    /// Radial distortion coefficients.
    pub k1: f64,
    pub k2: f64,
    pub k3: f64,
    /// Tangential distortion coefficients.
    pub p1: f64,
    pub p2: f64,
}

impl CalibrationRecord {
    /// Parse a `DewarpData` payload of the form `<date>;<nine floats>`.
    ///
    /// The comma-separated values after the first semicolon are, in order:
    /// fx, fy, cx, cy, k1, k2, p1, p2, k3. Anything other than exactly nine
    /// finite numbers is rejected.
    pub fn parse(payload: &str) -> Result<Self, DewarpError> {
        let (date, values) = payload
            .split_once(';')
            .ok_or_else(|| DewarpError::InvalidCalibration("missing ';' separator".into()))?;

        let fields: Vec<f64> = values
            .split(',')
            .map(|token| {
                let token = token.trim();
                token
                    .parse::<f64>()
                    .map_err(|_| DewarpError::InvalidCalibration(format!("bad number {:?}", token)))
            })
            .collect::<Result<_, _>>()?;

        if fields.len() != 9 {
            return Err(DewarpError::InvalidCalibration(format!(
                "expected 9 coefficients, got {}",
                fields.len()
            )));
        }
        if let Some(bad) = fields.iter().find(|v| !v.is_finite()) {
            return Err(DewarpError::InvalidCalibration(format!(
                "non-finite coefficient {}",
                bad
            )));
        }

        Ok(Self {
            capture_date: date.trim().to_string(),
            fx: fields[0],
            fy: fields[1],
            cx: fields[2],
            cy: fields[3],
            k1: fields[4],
            k2: fields[5],
            p1: fields[6],
            p2: fields[7],
            k3: fields[8],
        })
    }
}

/// Interpret a `DewarpFlag` tag value.
///
/// Any present, non-zero value marks the image as already corrected.
/// exiftool may hand the flag back as a number or a string depending on
/// invocation, so both forms are accepted.
pub fn flag_is_set(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map_or(false, |v| v != 0.0),
        serde_json::Value::String(s) => s.trim().parse::<f64>().map_or(true, |v| v != 0.0),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PHANTOM4_RTK: &str = "2018-09-04;3678.870000000000,3671.840000000000,\
        10.100000000000,27.290000000000,-0.268652000000,0.114663000000,\
        0.000015268800,-0.000046070700,-0.035026100000";

    #[test]
    fn parses_phantom4_rtk_record() {
        let rec = CalibrationRecord::parse(PHANTOM4_RTK).unwrap();
        assert_eq!(rec.capture_date, "2018-09-04");
        assert_eq!(rec.fx, 3678.87);
        assert_eq!(rec.fy, 3671.84);
        assert_eq!(rec.cx, 10.1);
        assert_eq!(rec.cy, 27.29);
        assert_eq!(rec.k1, -0.268652);
        assert_eq!(rec.k2, 0.114663);
        assert_eq!(rec.p1, 0.0000152688);
        assert_eq!(rec.p2, -0.0000460707);
        assert_eq!(rec.k3, -0.0350261);
    }

    #[test]
    fn tolerates_spaces_around_values() {
        let rec =
            CalibrationRecord::parse("2020-01-01; 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0")
                .unwrap();
        assert_eq!(rec.fx, 1.0);
        assert_eq!(rec.k3, 9.0);
    }

    #[test]
    fn rejects_missing_separator() {
        let err = CalibrationRecord::parse("1.0,2.0,3.0").unwrap_err();
        assert!(matches!(err, DewarpError::InvalidCalibration(_)));
    }

    #[test]
    fn rejects_wrong_field_count() {
        let err = CalibrationRecord::parse("2020-01-01;1.0,2.0,3.0").unwrap_err();
        assert!(matches!(err, DewarpError::InvalidCalibration(_)));

        let err = CalibrationRecord::parse("2020-01-01;1,2,3,4,5,6,7,8,9,10").unwrap_err();
        assert!(matches!(err, DewarpError::InvalidCalibration(_)));
    }

    #[test]
    fn rejects_non_numeric_token() {
        let err = CalibrationRecord::parse("2020-01-01;1,2,oops,4,5,6,7,8,9").unwrap_err();
        assert!(matches!(err, DewarpError::InvalidCalibration(_)));
    }

    #[test]
    fn rejects_non_finite_values() {
        let err = CalibrationRecord::parse("2020-01-01;1,2,inf,4,5,6,7,8,9").unwrap_err();
        assert!(matches!(err, DewarpError::InvalidCalibration(_)));

        let err = CalibrationRecord::parse("2020-01-01;1,2,NaN,4,5,6,7,8,9").unwrap_err();
        assert!(matches!(err, DewarpError::InvalidCalibration(_)));
    }

    #[test]
    fn flag_classification() {
        assert!(!flag_is_set(&json!(0)));
        assert!(!flag_is_set(&json!(0.0)));
        assert!(!flag_is_set(&json!("0")));
        assert!(!flag_is_set(&serde_json::Value::Null));

        assert!(flag_is_set(&json!(1)));
        assert!(flag_is_set(&json!(2)));
        assert!(flag_is_set(&json!("1")));
        assert!(flag_is_set(&json!(true)));
    }
}
