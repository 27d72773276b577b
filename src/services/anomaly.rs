//! Connection-quality analytics over the recent history of a connection.

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;
use utoipa::ToSchema;

use crate::{
    config::PresenceConfig,
    dao::models::{ConnectionKey, ConnectionRecord},
    error::ServiceError,
    services::recorder::ConnectionRecorder,
    state::state_machine::ConnectionState,
};

const PROLONGED_DISCONNECTION_THRESHOLD: usize = 1;
const HIGH_RECONNECTION_RATE: f64 = 80.0;

/// How far past its threshold a detector fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Below threshold.
    Low,
    /// At least the threshold.
    Medium,
    /// At least twice the threshold.
    High,
    /// At least three times the threshold.
    Critical,
}

impl Severity {
    /// Classify `count` against `threshold`.
    pub fn classify(count: usize, threshold: usize) -> Self {
        let threshold = threshold.max(1);
        if count >= threshold * 3 {
            Severity::Critical
        } else if count >= threshold * 2 {
            Severity::High
        } else if count >= threshold {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

/// Outcome of a single detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct AnomalyReport {
    /// Whether the count reached the threshold.
    pub anomalous: bool,
    /// Severity of the finding.
    pub severity: Severity,
    /// Observed occurrences inside the analysis window.
    pub count: usize,
    /// Occurrences needed to flag the anomaly.
    pub threshold: usize,
}

impl AnomalyReport {
    fn detect(count: usize, threshold: usize) -> Self {
        Self {
            anomalous: count >= threshold.max(1),
            severity: Severity::classify(count, threshold),
            count,
            threshold,
        }
    }
}

/// Every detector's findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct Anomalies {
    /// Many disconnections inside the window.
    pub frequent_disconnections: AnomalyReport,
    /// Many reconnections faster than the rapid window.
    pub rapid_reconnections: AnomalyReport,
    /// Disconnections left unresolved for more than twice the grace period.
    pub prolonged_disconnections: AnomalyReport,
}

impl Anomalies {
    /// Number of detectors that fired.
    pub fn count(&self) -> usize {
        [
            self.frequent_disconnections,
            self.rapid_reconnections,
            self.prolonged_disconnections,
        ]
        .iter()
        .filter(|report| report.anomalous)
        .count()
    }
}

/// Raw statistics over the analysis window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, ToSchema)]
pub struct ConnectionStats {
    /// Records touched inside the window.
    pub total_connections: usize,
    /// Records that went through a disconnection.
    pub disconnections: usize,
    /// Records that came back from a disconnection.
    pub reconnections: usize,
    /// Reconnections per hundred disconnections; 0 without disconnections.
    pub reconnection_rate: f64,
    /// Mean time spent disconnected over resolved records, in seconds.
    pub average_disconnection_secs: f64,
}

/// Bucketed quality score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum QualityLevel {
    /// 90 and above.
    Excellent,
    /// 70 to 89.
    Good,
    /// 50 to 69.
    Fair,
    /// 30 to 49.
    Poor,
    /// Below 30.
    Critical,
}

impl QualityLevel {
    /// Bucket a score.
    pub fn from_score(score: u8) -> Self {
        match score {
            90.. => QualityLevel::Excellent,
            70..=89 => QualityLevel::Good,
            50..=69 => QualityLevel::Fair,
            30..=49 => QualityLevel::Poor,
            _ => QualityLevel::Critical,
        }
    }
}

/// Quality assessment of one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionQuality {
    /// Connection the assessment covers.
    pub key: ConnectionKey,
    /// Raw statistics.
    pub stats: ConnectionStats,
    /// Detector findings.
    pub anomalies: Anomalies,
    /// Score between 0 and 100.
    pub score: u8,
    /// Bucketed score.
    pub level: QualityLevel,
    /// Analysis window length.
    pub window: Duration,
    /// When the assessment was computed.
    pub computed_at: SystemTime,
}

/// Compute the quality of a connection from the records touched inside the window.
pub fn analyze(
    key: ConnectionKey,
    records: &[ConnectionRecord],
    now: SystemTime,
    config: &PresenceConfig,
) -> ConnectionQuality {
    let disconnections = records
        .iter()
        .filter(|record| record.disconnected_at.is_some())
        .count();
    let resolved: Vec<Duration> = records
        .iter()
        .filter_map(ConnectionRecord::resolved_disconnection)
        .collect();
    let reconnections = resolved.len();

    let reconnection_rate = if disconnections == 0 {
        0.0
    } else {
        reconnections as f64 / disconnections as f64 * 100.0
    };
    let average_disconnection_secs = if resolved.is_empty() {
        0.0
    } else {
        resolved.iter().map(Duration::as_secs_f64).sum::<f64>() / resolved.len() as f64
    };

    let rapid_window = config.rapid_reconnection_window();
    let rapid = resolved
        .iter()
        .filter(|duration| **duration < rapid_window)
        .count();

    let prolonged_after = config.grace_period(key.context.kind) * 2;
    let prolonged = records
        .iter()
        .filter(|record| {
            record.state == ConnectionState::TemporarilyDisconnected
                && record.reconnected_at.is_none()
        })
        .filter_map(|record| record.disconnected_at)
        .filter(|down| now.duration_since(*down).unwrap_or_default() > prolonged_after)
        .count();

    let stats = ConnectionStats {
        total_connections: records.len(),
        disconnections,
        reconnections,
        reconnection_rate,
        average_disconnection_secs,
    };
    let anomalies = Anomalies {
        frequent_disconnections: AnomalyReport::detect(
            disconnections,
            config.disconnection_threshold,
        ),
        rapid_reconnections: AnomalyReport::detect(rapid, config.rapid_reconnection_threshold),
        prolonged_disconnections: AnomalyReport::detect(
            prolonged,
            PROLONGED_DISCONNECTION_THRESHOLD,
        ),
    };
    let score = quality_score(&stats, &anomalies);

    ConnectionQuality {
        key,
        stats,
        anomalies,
        score,
        level: QualityLevel::from_score(score),
        window: config.analysis_window(),
        computed_at: now,
    }
}

fn quality_score(stats: &ConnectionStats, anomalies: &Anomalies) -> u8 {
    let disconnection_penalty = (stats.disconnections as i64 * 5).min(50);
    let rate_bonus = if stats.reconnection_rate > HIGH_RECONNECTION_RATE {
        10
    } else {
        0
    };
    let anomaly_penalty = anomalies.count() as i64 * 15;

    (100 - disconnection_penalty + rate_bonus - anomaly_penalty).clamp(0, 100) as u8
}

struct CachedQuality {
    quality: ConnectionQuality,
    expires_at: SystemTime,
}

/// Cached read model over [`analyze`].
///
/// Readers tolerate staleness up to the cache TTL; writers call
/// [`AnomalyAnalyzer::invalidate`] so their own reads are fresh.
pub struct AnomalyAnalyzer {
    recorder: Arc<ConnectionRecorder>,
    config: Arc<PresenceConfig>,
    cache: DashMap<ConnectionKey, CachedQuality>,
}

impl AnomalyAnalyzer {
    /// Build an analyzer reading through the recorder.
    pub fn new(recorder: Arc<ConnectionRecorder>, config: Arc<PresenceConfig>) -> Self {
        Self {
            recorder,
            config,
            cache: DashMap::new(),
        }
    }

    /// Quality of the connection, from cache when fresh.
    pub async fn quality(&self, key: ConnectionKey) -> Result<ConnectionQuality, ServiceError> {
        let now = self.recorder.now();
        if let Some(cached) = self.cache.get(&key)
            && cached.expires_at > now
        {
            return Ok(cached.quality.clone());
        }

        let since = now
            .checked_sub(self.config.analysis_window())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let records = self.recorder.history(key, since).await?;
        let quality = analyze(key, &records, now, &self.config);
        debug!(
            subject_id = key.subject_id,
            context = %key.context,
            records = records.len(),
            score = quality.score,
            "connection quality computed"
        );

        self.cache.retain(|_, cached| cached.expires_at > now);
        if !records.is_empty() {
            self.cache.insert(
                key,
                CachedQuality {
                    quality: quality.clone(),
                    expires_at: now + self.config.analyzer_cache_ttl(),
                },
            );
        }
        Ok(quality)
    }

    /// Drop the cached assessment of the connection.
    pub fn invalidate(&self, key: ConnectionKey) {
        self.cache.remove(&key);
    }

    #[cfg(test)]
    fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use super::*;
    use crate::{dao::models::PresenceContext, test_support::Harness};

    fn key() -> ConnectionKey {
        ConnectionKey::new(7, PresenceContext::room(42))
    }

    #[test]
    fn severity_scales_with_threshold() {
        assert_eq!(Severity::classify(2, 3), Severity::Low);
        assert_eq!(Severity::classify(3, 3), Severity::Medium);
        assert_eq!(Severity::classify(6, 3), Severity::High);
        assert_eq!(Severity::classify(9, 3), Severity::Critical);
    }

    #[test]
    fn quality_levels_bucket_scores() {
        assert_eq!(QualityLevel::from_score(100), QualityLevel::Excellent);
        assert_eq!(QualityLevel::from_score(85), QualityLevel::Good);
        assert_eq!(QualityLevel::from_score(50), QualityLevel::Fair);
        assert_eq!(QualityLevel::from_score(30), QualityLevel::Poor);
        assert_eq!(QualityLevel::from_score(0), QualityLevel::Critical);
    }

    #[test]
    fn two_resolved_disconnections_with_one_anomaly_score_85() {
        let config = PresenceConfig {
            disconnection_threshold: 2,
            ..PresenceConfig::default()
        };
        let start = UNIX_EPOCH + Duration::from_secs(10_000);
        let records: Vec<ConnectionRecord> = (0..2)
            .map(|seq| {
                let mut record = ConnectionRecord::open(key(), seq, start, None);
                let down = start + Duration::from_secs(100 * seq);
                record.disconnected_at = Some(down);
                record.reconnected_at = Some(down + Duration::from_secs(45));
                record
            })
            .collect();

        let quality = analyze(key(), &records, start + Duration::from_secs(600), &config);

        assert_eq!(quality.stats.disconnections, 2);
        assert_eq!(quality.stats.reconnection_rate, 100.0);
        assert_eq!(quality.stats.average_disconnection_secs, 45.0);
        assert!(quality.anomalies.frequent_disconnections.anomalous);
        assert!(!quality.anomalies.rapid_reconnections.anomalous);
        assert_eq!(quality.anomalies.count(), 1);
        assert_eq!(quality.score, 85);
        assert_eq!(quality.level, QualityLevel::Good);
    }

    #[test]
    fn empty_history_is_excellent() {
        let quality = analyze(key(), &[], UNIX_EPOCH, &PresenceConfig::default());
        assert_eq!(quality.stats.reconnection_rate, 0.0);
        assert_eq!(quality.score, 100);
        assert_eq!(quality.level, QualityLevel::Excellent);
    }

    #[tokio::test]
    async fn three_rapid_reconnections_raise_medium_anomaly() {
        let harness = Harness::new();
        let recorder = harness.recorder();
        recorder.record_initial_connection(key(), None).await.unwrap();
        for _ in 0..3 {
            harness.clock.advance(Duration::from_secs(60));
            recorder.record_disconnection(key(), None).await.unwrap().unwrap();
            harness.clock.advance(Duration::from_secs(5));
            recorder.record_reconnection(key(), None).await.unwrap().unwrap();
        }

        let quality = harness.analyzer().quality(key()).await.unwrap();

        let rapid = quality.anomalies.rapid_reconnections;
        assert!(rapid.anomalous);
        assert_eq!(rapid.count, 3);
        assert_eq!(rapid.severity, Severity::Medium);
        assert!(!quality.anomalies.frequent_disconnections.anomalous);
        assert_eq!(quality.stats.average_disconnection_secs, 5.0);
    }

    #[tokio::test]
    async fn unresolved_disconnection_past_twice_grace_is_prolonged() {
        let harness = Harness::new();
        let recorder = harness.recorder();
        recorder.record_initial_connection(key(), None).await.unwrap();
        recorder.record_disconnection(key(), None).await.unwrap();

        harness.clock.advance(Duration::from_secs(121));
        let quality = harness.analyzer().quality(key()).await.unwrap();

        assert!(quality.anomalies.prolonged_disconnections.anomalous);
        assert_eq!(quality.anomalies.prolonged_disconnections.count, 1);
    }

    #[tokio::test]
    async fn cached_quality_is_served_until_invalidated() {
        let harness = Harness::new();
        let recorder = harness.recorder();
        let analyzer = harness.analyzer();
        recorder.record_initial_connection(key(), None).await.unwrap();

        let before = analyzer.quality(key()).await.unwrap();
        assert_eq!(before.stats.disconnections, 0);

        recorder.record_disconnection(key(), None).await.unwrap();
        let cached = analyzer.quality(key()).await.unwrap();
        assert_eq!(cached, before);

        analyzer.invalidate(key());
        let fresh = analyzer.quality(key()).await.unwrap();
        assert_eq!(fresh.stats.disconnections, 1);
    }

    #[tokio::test]
    async fn cached_quality_expires_after_ttl() {
        let harness = Harness::new();
        let recorder = harness.recorder();
        let analyzer = harness.analyzer();
        recorder.record_initial_connection(key(), None).await.unwrap();
        analyzer.quality(key()).await.unwrap();

        recorder.record_disconnection(key(), None).await.unwrap();
        harness.clock.advance(Duration::from_secs(301));

        let fresh = analyzer.quality(key()).await.unwrap();
        assert_eq!(fresh.stats.disconnections, 1);
    }

    #[tokio::test]
    async fn expired_entries_are_evicted_and_unseen_keys_never_cached() {
        let harness = Harness::new();
        let recorder = harness.recorder();
        let analyzer = harness.analyzer();
        recorder.record_initial_connection(key(), None).await.unwrap();
        analyzer.quality(key()).await.unwrap();
        assert_eq!(analyzer.cached_len(), 1);

        for context_id in 1..=20 {
            let unseen = ConnectionKey::new(7, PresenceContext::debate(context_id));
            analyzer.quality(unseen).await.unwrap();
        }
        assert_eq!(analyzer.cached_len(), 1);

        harness.clock.advance(Duration::from_secs(301));
        let other = ConnectionKey::new(3, PresenceContext::room(8));
        recorder.record_initial_connection(other, None).await.unwrap();
        analyzer.quality(other).await.unwrap();
        assert_eq!(analyzer.cached_len(), 1);
        analyzer.invalidate(other);
        assert_eq!(analyzer.cached_len(), 0);
    }
}
