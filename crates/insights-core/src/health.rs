//! Per-source discovery and failure statistics derived from queue history.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::QueueItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Error,
    Inactive,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub last_discovery: Option<DateTime<Utc>>,
    pub items_7d: u32,
    pub items_30d: u32,
    pub failed_7d: u32,
}

impl SourceStats {
    pub fn error_rate(&self) -> f64 {
        if self.items_7d == 0 {
            0.0
        } else {
            f64::from(self.failed_7d) / f64::from(self.items_7d)
        }
    }

    /// First match wins: inactive, error, warning, healthy.
    pub fn classify(&self, now: DateTime<Utc>) -> HealthStatus {
        let inactive = match self.last_discovery {
            Some(last) => now - last > Duration::days(7),
            None => true,
        };
        let error_rate = self.error_rate();
        if inactive {
            HealthStatus::Inactive
        } else if error_rate > 0.3 {
            HealthStatus::Error
        } else if error_rate > 0.1 || self.items_7d < 2 {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceHealth {
    pub source_slug: String,
    pub last_discovery: Option<DateTime<Utc>>,
    pub items_7d: u32,
    pub items_30d: u32,
    pub failed_7d: u32,
    pub total_7d: u32,
    /// Rounded percentage.
    pub error_rate: u32,
    pub health_status: HealthStatus,
}

/// Group items discovered in the last 30 days by `payload.source_slug`.
pub fn aggregate(items: &[QueueItem], failed_code: i32, now: DateTime<Utc>) -> Vec<SourceHealth> {
    let seven_days_ago = now - Duration::days(7);
    let thirty_days_ago = now - Duration::days(30);

    let mut stats: BTreeMap<String, SourceStats> = BTreeMap::new();
    for item in items {
        let Some(slug) = item.source_slug() else {
            continue;
        };
        if item.discovered_at < thirty_days_ago {
            continue;
        }
        let entry = stats.entry(slug.to_string()).or_default();
        entry.items_30d += 1;
        if item.discovered_at >= seven_days_ago {
            entry.items_7d += 1;
            if item.status_code == failed_code {
                entry.failed_7d += 1;
            }
        }
        if entry.last_discovery.map_or(true, |last| item.discovered_at > last) {
            entry.last_discovery = Some(item.discovered_at);
        }
    }

    stats
        .into_iter()
        .map(|(source_slug, s)| SourceHealth {
            health_status: s.classify(now),
            error_rate: (s.error_rate() * 100.0).round() as u32,
            source_slug,
            last_discovery: s.last_discovery,
            items_7d: s.items_7d,
            items_30d: s.items_30d,
            failed_7d: s.failed_7d,
            total_7d: s.items_7d,
        })
        .collect()
}
