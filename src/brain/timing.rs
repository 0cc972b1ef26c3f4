//! 秒数（f64）と chrono の時刻・期間の相互変換

use chrono::{DateTime, Duration, Utc};

/// 秒数を chrono の期間に変換（ミリ秒精度、負値は 0 に丸める）
pub fn secs(seconds: f64) -> Duration {
    if !seconds.is_finite() || seconds <= 0.0 {
        return Duration::zero();
    }
    Duration::milliseconds((seconds * 1000.0).round() as i64)
}

/// 期間を秒数に変換
pub fn as_secs_f64(duration: Duration) -> f64 {
    duration.num_milliseconds() as f64 / 1000.0
}

/// エポック秒（小数）を UTC 時刻に変換
pub fn from_epoch_secs(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    DateTime::<Utc>::from_timestamp_millis((seconds * 1000.0).round() as i64)
}

/// UTC 時刻をエポック秒（小数）に変換
pub fn to_epoch_secs(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secs_roundtrip_precision() {
        assert_eq!(secs(3.0), Duration::seconds(3));
        assert_eq!(secs(0.25), Duration::milliseconds(250));
        assert_eq!(as_secs_f64(Duration::milliseconds(1500)), 1.5);
    }

    #[test]
    fn test_negative_and_nan_clamp_to_zero() {
        assert_eq!(secs(-1.0), Duration::zero());
        assert_eq!(secs(f64::NAN), Duration::zero());
    }

    #[test]
    fn test_epoch_conversion() {
        let at = from_epoch_secs(1_704_067_200.5).unwrap();
        assert_eq!(to_epoch_secs(at), 1_704_067_200.5);
        assert!(from_epoch_secs(-5.0).is_none());
        assert!(from_epoch_secs(f64::INFINITY).is_none());
    }
}
