//! Utility functions for RustVTL

use crate::bdev::UNIT_SIZE;

/// Format bytes in human-readable format (B, KB, MB, GB, TB)
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    const THRESHOLD: u64 = 1024;

    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= THRESHOLD as f64 && unit_index < UNITS.len() - 1 {
        size /= THRESHOLD as f64;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Allocation units as a human-readable byte count
pub fn format_units(units: u64) -> String {
    format_bytes(units.saturating_mul(UNIT_SIZE))
}

/// Format duration in human-readable format
pub fn format_duration(duration_secs: f64) -> String {
    if duration_secs < 60.0 {
        format!("{:.1}s", duration_secs)
    } else if duration_secs < 3600.0 {
        let minutes = (duration_secs / 60.0) as u32;
        let seconds = duration_secs % 60.0;
        format!("{}m {:.1}s", minutes, seconds)
    } else {
        let hours = (duration_secs / 3600.0) as u32;
        let minutes = ((duration_secs % 3600.0) / 60.0) as u32;
        let seconds = duration_secs % 60.0;
        format!("{}h {}m {:.1}s", hours, minutes, seconds)
    }
}

/// Percentage of `part` in `whole`, 0 when `whole` is empty
pub fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(64 * 1024 * 1024), "64.00 MB");
    }

    #[test]
    fn test_format_units() {
        assert_eq!(format_units(0), "0 B");
        assert_eq!(format_units(1), "64.00 MB");
        assert_eq!(format_units(16), "1.00 GB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(1.5), "1.5s");
        assert_eq!(format_duration(90.0), "1m 30.0s");
        assert_eq!(format_duration(3725.0), "1h 2m 5.0s");
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(1, 4), 25.0);
        assert_eq!(percent(5, 0), 0.0);
    }
}
