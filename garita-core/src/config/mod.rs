//! Runtime settings consumed by the lifecycle jobs.
//!
//! The server crate reads them from its TOML file and keeps them in a
//! [`ConfigStore`] so that a SIGHUP reload reaches every job on its next
//! tick.

mod config_store;
mod tolerance;

pub use config_store::{ConfigStore, ConfigWatcher};
pub use tolerance::{Tolerance, ToleranceError, ToleranceUnit};

use time::UtcOffset;

/// Tolerances and switches for the registration lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleConfig {
    /// Grace period around the scheduled entry (`tiempoToleranciaEntrada`).
    pub entry_tolerance: Tolerance,
    /// Grace period before a stale registration is closed
    /// (`tiempoCancelacionRegistros`).
    pub cancellation_tolerance: Tolerance,
    /// Grace period after the scheduled exit (`tiempoToleranciaSalida`).
    pub exit_tolerance: Tolerance,
    /// Gates every panel call (`habilitarIntegracionHv`).
    pub panel_integration_enabled: bool,
    /// Offset of the site wall clock, used for panel times and day boundaries.
    pub utc_offset: UtcOffset,
}

pub type LifecycleStore = ConfigStore<LifecycleConfig>;

/// Parse `"Z"`, `"UTC"` or `"±HH:MM"`.
pub fn parse_utc_offset(value: &str) -> Option<UtcOffset> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("z") || value.eq_ignore_ascii_case("utc") {
        return Some(UtcOffset::UTC);
    }
    let (sign, rest) = match value.as_bytes().first()? {
        b'+' => (1i8, &value[1..]),
        b'-' => (-1i8, &value[1..]),
        _ => return None,
    };
    let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours: i8 = hours.parse().ok()?;
    let minutes: i8 = minutes.parse().ok()?;
    if !(0..=23).contains(&hours) || !(0..=59).contains(&minutes) {
        return None;
    }
    UtcOffset::from_hms(sign * hours, sign * minutes, 0).ok()
}

#[cfg(test)]
pub(crate) fn test_lifecycle() -> LifecycleConfig {
    LifecycleConfig {
        entry_tolerance: Tolerance::new(30, ToleranceUnit::Minute),
        cancellation_tolerance: Tolerance::new(1, ToleranceUnit::Hour),
        exit_tolerance: Tolerance::new(30, ToleranceUnit::Minute),
        panel_integration_enabled: true,
        utc_offset: UtcOffset::UTC,
    }
}
