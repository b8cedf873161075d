use chrono::Local;

/// Current wall-clock time as HH:MM:SS for display.
pub fn ts() -> String {
    Local::now().format("%H:%M:%S").to_string()
}

/// Current time as fractional epoch seconds.
pub fn epoch_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Format a duration as `XmYYs`.
pub fn fmt_duration(secs: f64) -> String {
    let total = secs.max(0.0) as u64;
    format!("{}m{:02}s", total / 60, total % 60)
}

/// Format an elapsed span for timeline display: seconds under two minutes,
/// `XmYs` beyond.
pub fn fmt_elapsed(secs: f64) -> String {
    let total = secs.max(0.0) as u64;
    if total < 120 {
        format!("{total}s")
    } else {
        format!("{}m{}s", total / 60, total % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_formatting_pads_seconds() {
        assert_eq!(fmt_duration(0.0), "0m00s");
        assert_eq!(fmt_duration(62.0), "1m02s");
        assert_eq!(fmt_duration(3725.4), "62m05s");
    }

    #[test]
    fn elapsed_switches_units_at_two_minutes() {
        assert_eq!(fmt_elapsed(45.0), "45s");
        assert_eq!(fmt_elapsed(119.0), "119s");
        assert_eq!(fmt_elapsed(121.0), "2m1s");
    }

    #[test]
    fn ts_is_wall_clock_shaped() {
        let t = ts();
        assert_eq!(t.len(), 8);
        assert_eq!(t.as_bytes()[2], b':');
        assert_eq!(t.as_bytes()[5], b':');
    }
}
