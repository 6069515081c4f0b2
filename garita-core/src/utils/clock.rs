//! Panel clock-drift math.

use crate::entities::event::ClockSample;
use itertools::Itertools;
use time::OffsetDateTime;

/// Samples beyond 14h are corrupt readings, not drift.
pub const MAX_VALID_SKEW_SECS: i64 = 14 * 60 * 60;
/// How close a median must be to a whole hour to snap to it.
pub const ROUND_HOUR_TOLERANCE_SECS: f64 = 10.0 * 60.0;
pub const ALERT_THRESHOLD_SECS: i64 = 30 * 60;

const AUTO_OFFSET_MIN_SECS: i64 = 4 * 60 * 60;
const AUTO_OFFSET_MAX_SECS: i64 = 12 * 60 * 60;
const AUTO_OFFSET_HOUR_TOLERANCE_SECS: i64 = 5 * 60;

const HOUR: f64 = 3600.0;

/// Result of a recalibration pass, persisted on the panel record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockCalibration {
    pub offset_segundos: i32,
    pub alerta: bool,
    /// Rounded raw median.
    pub ultimo_desfase_segundos: i32,
    pub ultima_muestra: OffsetDateTime,
}

/// Skew seen on a single panel report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkewObservation {
    pub alerta: bool,
    pub desfase_segundos: i32,
    pub muestra: OffsetDateTime,
    /// Set when automatic detection found a whole-hour offset.
    pub offset_detectado: Option<i32>,
}

/// Middle value, or the mean of the two middle values for an even count.
pub fn median(values: &[i64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let sorted = values.iter().copied().sorted_unstable().collect_vec();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] as f64 + sorted[mid] as f64) / 2.0)
    } else {
        Some(sorted[mid] as f64)
    }
}

/// Snap to the nearest whole hour when within tolerance, else the rounded
/// median. A nearest hour of zero always yields zero.
pub fn recommended_offset(median: f64) -> i64 {
    let rounded_hour = (median / HOUR).round() * HOUR;
    if rounded_hour == 0.0 {
        return 0;
    }
    if (median - rounded_hour).abs() <= ROUND_HOUR_TOLERANCE_SECS {
        rounded_hour as i64
    } else {
        median.round() as i64
    }
}

pub fn is_alert(skew_secs: i64) -> bool {
    skew_secs.abs() >= ALERT_THRESHOLD_SECS
}

/// Compute a calibration from a window of samples. `None` when no sample
/// is inside the validity ceiling. `ultima_muestra` is the latest reading
/// of the whole window, discarded ones included.
pub fn calibrate(samples: &[ClockSample]) -> Option<ClockCalibration> {
    let values = samples
        .iter()
        .map(|s| i64::from(s.desfase_reloj_segundos))
        .filter(|v| v.abs() <= MAX_VALID_SKEW_SECS)
        .collect_vec();
    let median = median(&values)?;
    let ultima_muestra = samples.iter().map(|s| s.fecha_servidor_recepcion).max()?;
    let offset = recommended_offset(median);

    Some(ClockCalibration {
        offset_segundos: saturate(offset),
        alerta: is_alert(offset),
        ultimo_desfase_segundos: saturate(median.round() as i64),
        ultima_muestra,
    })
}

/// Whole-hour offset implied by one raw reading, for panels that have no
/// offset yet. Only 4h to 12h offsets within 5 min of the hour qualify.
pub fn detect_auto_offset(skew_secs: i64, current_offset_secs: i64) -> Option<i64> {
    if current_offset_secs != 0 {
        return None;
    }
    let hours = (skew_secs as f64 / HOUR).round() as i64;
    if hours == 0 {
        return None;
    }
    let candidate = hours * 3600;
    if !(AUTO_OFFSET_MIN_SECS..=AUTO_OFFSET_MAX_SECS).contains(&candidate.abs()) {
        return None;
    }
    if (skew_secs - candidate).abs() > AUTO_OFFSET_HOUR_TOLERANCE_SECS {
        return None;
    }
    Some(candidate)
}

pub(crate) fn saturate(value: i64) -> i32 {
    value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}
