//! Time utility functions

use chrono::{DateTime, Utc};

/// Current time in epoch milliseconds
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert epoch milliseconds to DateTime<Utc>
pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(|| {
        tracing::warn!(ms, "Invalid timestamp, using epoch");
        DateTime::UNIX_EPOCH
    })
}

/// Parse an RFC 3339 timestamp to epoch milliseconds
pub fn parse_rfc3339_ms(ts: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ms_to_datetime_known_value() {
        // 2024-01-01 00:00:00 UTC
        let dt = ms_to_datetime(1_704_067_200_000);
        assert_eq!(dt.to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_parse_rfc3339_ms() {
        assert_eq!(
            parse_rfc3339_ms("2024-01-01T00:00:00Z"),
            Some(1_704_067_200_000)
        );
        assert_eq!(parse_rfc3339_ms("not a timestamp"), None);
    }

    #[test]
    fn test_now_ms_is_recent() {
        let now = now_ms();
        assert!(now > 1_704_067_200_000);
        assert_eq!(ms_to_datetime(now).timestamp_millis(), now);
    }
}
