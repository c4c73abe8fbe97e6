//! Wall-clock timestamps for persisted records.

use chrono::{SecondsFormat, Utc};

/// Current UTC time as RFC 3339 with second precision (`2026-01-01T00:00:00Z`).
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_have_no_spaces_and_end_in_z() {
        let now = now_rfc3339();
        assert!(now.ends_with('Z'));
        assert!(!now.contains(' '));
        assert!(chrono::DateTime::parse_from_rfc3339(&now).is_ok());
    }
}
