use std::time::Duration;

use chrono::{DateTime, Local};

/// ISO-8601 timestamp with millisecond precision, e.g.
/// `2024-03-01T12:00:00.250+0000`
///
/// Returns `None` for instants chrono cannot represent.
#[must_use]
pub fn iso8601_time(millis_since_epoch: i64, utc: bool) -> Option<String> {
    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%z";
    let instant = DateTime::from_timestamp_millis(millis_since_epoch)?;
    Some(if utc {
        instant.format(FORMAT).to_string()
    } else {
        instant.with_timezone(&Local).format(FORMAT).to_string()
    })
}

/// `"{label} {d} days {h}:{mm} hours"`
#[must_use]
pub fn print_dhm(label: &str, seconds: i64) -> String {
    let days = seconds / 86_400;
    let hours = seconds / 3_600 - days * 24;
    let minutes = (seconds / 60 - days * 1_440 - hours * 60).max(0);
    format!("{label} {days} days {hours}:{minutes:02} hours")
}

/// Elapsed-time line for crash reports
#[must_use]
pub fn elapsed_time_summary(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let micros = elapsed.subsec_micros();
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = secs % 60;
    format!(
        " elapsed time: {secs}.{micros:06} seconds ({days}d {hours}h {minutes}m {seconds}s)"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, "up 0 days 0:00 hours")]
    #[case(59, "up 0 days 0:00 hours")]
    #[case(3_660, "up 0 days 1:01 hours")]
    #[case(90_000 + 120, "up 1 days 1:02 hours")]
    fn dhm(#[case] secs: i64, #[case] expected: &str) {
        assert_eq!(print_dhm("up", secs), expected);
    }

    #[test]
    fn iso8601_utc() {
        assert_eq!(
            iso8601_time(1_709_294_400_250, true).as_deref(),
            Some("2024-03-01T12:00:00.250+0000")
        );
    }

    #[test]
    fn iso8601_out_of_range() {
        assert_eq!(iso8601_time(i64::MAX, true), None);
    }

    #[test]
    fn elapsed_breakdown() {
        let d = Duration::from_micros(90_061_000_042);
        assert_eq!(
            elapsed_time_summary(d),
            " elapsed time: 90061.000042 seconds (1d 1h 1m 1s)"
        );
    }
}
