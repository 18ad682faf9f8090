//! Pure connection health assessment
//!
//! The guardian records when the connection came up, when it was last lost
//! and how many recoveries succeeded; these functions turn that into a
//! [`HealthMetrics`] snapshot and a coarse [`ConnectionQuality`].

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Raw timestamps kept by the guardian under its state lock
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthRecord {
    pub connected_at: Option<Instant>,
    pub last_disconnect_at: Option<Instant>,
    pub reconnect_count: u32,
}

impl HealthRecord {
    pub fn mark_connected(&mut self) {
        self.connected_at = Some(Instant::now());
    }

    pub fn mark_disconnected(&mut self) {
        self.connected_at = None;
        self.last_disconnect_at = Some(Instant::now());
    }

    pub fn mark_recovered(&mut self) {
        self.reconnect_count = self.reconnect_count.saturating_add(1);
        self.mark_connected();
    }
}

/// Health snapshot for a connection
#[derive(Debug, Clone, Serialize)]
pub struct HealthMetrics {
    /// Time since the current connection was established
    pub uptime: Option<Duration>,
    /// Time since the connection was last lost
    pub time_since_last_disconnect: Option<Duration>,
    /// Successful automatic recoveries
    pub reconnect_count: u32,
    pub is_connected: bool,
    pub quality: ConnectionQuality,
}

/// Connection quality assessment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    /// Long-lived connection without recoveries
    Excellent,
    Good,
    /// Some recoveries, but working
    Fair,
    /// Frequent recoveries
    Poor,
    /// Not connected
    Critical,
}

/// Build a metrics snapshot from the guardian's record (pure function)
pub fn calculate_health_metrics(record: &HealthRecord) -> HealthMetrics {
    let now = Instant::now();
    let uptime = record.connected_at.map(|t| now.duration_since(t));
    let time_since_last_disconnect = record.last_disconnect_at.map(|t| now.duration_since(t));

    HealthMetrics {
        uptime,
        time_since_last_disconnect,
        reconnect_count: record.reconnect_count,
        is_connected: uptime.is_some(),
        quality: assess_connection_quality(uptime, record.reconnect_count),
    }
}

/// Assess connection quality from uptime and recovery count (pure function)
pub fn assess_connection_quality(uptime: Option<Duration>, reconnect_count: u32) -> ConnectionQuality {
    let Some(uptime) = uptime else {
        return ConnectionQuality::Critical;
    };

    match reconnect_count {
        0 if uptime > Duration::from_secs(3600) => ConnectionQuality::Excellent,
        0 => ConnectionQuality::Good,
        1..=2 if uptime > Duration::from_secs(1800) => ConnectionQuality::Good,
        1..=5 => ConnectionQuality::Fair,
        6..=10 => ConnectionQuality::Poor,
        _ => ConnectionQuality::Critical,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_not_connected_is_critical() {
        assert_eq!(assess_connection_quality(None, 0), ConnectionQuality::Critical);
    }

    #[test]
    fn test_quality_levels() {
        let hour = Duration::from_secs(3601);
        let minute = Duration::from_secs(60);

        assert_eq!(assess_connection_quality(Some(hour), 0), ConnectionQuality::Excellent);
        assert_eq!(assess_connection_quality(Some(minute), 0), ConnectionQuality::Good);
        assert_eq!(assess_connection_quality(Some(hour), 2), ConnectionQuality::Good);
        assert_eq!(assess_connection_quality(Some(minute), 2), ConnectionQuality::Fair);
        assert_eq!(assess_connection_quality(Some(hour), 4), ConnectionQuality::Fair);
        assert_eq!(assess_connection_quality(Some(hour), 8), ConnectionQuality::Poor);
        assert_eq!(assess_connection_quality(Some(hour), 11), ConnectionQuality::Critical);
    }

    #[test]
    fn test_record_transitions() {
        let mut record = HealthRecord::default();
        let metrics = calculate_health_metrics(&record);
        assert!(!metrics.is_connected);
        assert_eq!(metrics.reconnect_count, 0);

        record.mark_connected();
        assert!(calculate_health_metrics(&record).is_connected);

        record.mark_disconnected();
        let metrics = calculate_health_metrics(&record);
        assert!(!metrics.is_connected);
        assert!(metrics.time_since_last_disconnect.is_some());

        record.mark_recovered();
        let metrics = calculate_health_metrics(&record);
        assert!(metrics.is_connected);
        assert_eq!(metrics.reconnect_count, 1);
        assert_eq!(metrics.quality, ConnectionQuality::Fair);
    }
}
