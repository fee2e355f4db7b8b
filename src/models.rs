use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

// ============================================================================
// Tracking Jobs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TrackingFrequency {
    Hourly,
    #[serde(rename = "every_6_hours")]
    Every6Hours,
    Daily,
    Weekly,
}

impl TrackingFrequency {
    pub fn interval(self) -> Duration {
        match self {
            TrackingFrequency::Hourly => Duration::hours(1),
            TrackingFrequency::Every6Hours => Duration::hours(6),
            TrackingFrequency::Daily => Duration::hours(24),
            TrackingFrequency::Weekly => Duration::days(7),
        }
    }
}

impl FromStr for TrackingFrequency {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hourly" => Ok(TrackingFrequency::Hourly),
            "every_6_hours" => Ok(TrackingFrequency::Every6Hours),
            "daily" => Ok(TrackingFrequency::Daily),
            "weekly" => Ok(TrackingFrequency::Weekly),
            other => Err(anyhow::anyhow!("unknown tracking frequency '{}'", other)),
        }
    }
}

/// Next time a job becomes due when it last ran at `at`.
pub fn next_due_time(frequency: TrackingFrequency, at: DateTime<Utc>) -> DateTime<Utc> {
    at + frequency.interval()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Active,
    Paused,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Active => "active",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(JobStatus::Active),
            "paused" => Ok(JobStatus::Paused),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(anyhow::anyhow!("unknown job status '{}'", other)),
        }
    }
}

/// Amazon storefronts the tracker knows how to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum Marketplace {
    US,
    UK,
    DE,
    FR,
    IT,
    ES,
    CA,
    JP,
    AU,
    IN,
    MX,
    BR,
}

impl Marketplace {
    pub const ALL: [Marketplace; 12] = [
        Marketplace::US,
        Marketplace::UK,
        Marketplace::DE,
        Marketplace::FR,
        Marketplace::IT,
        Marketplace::ES,
        Marketplace::CA,
        Marketplace::JP,
        Marketplace::AU,
        Marketplace::IN,
        Marketplace::MX,
        Marketplace::BR,
    ];

    pub fn base_url(self) -> &'static str {
        match self {
            Marketplace::US => "https://www.amazon.com",
            Marketplace::UK => "https://www.amazon.co.uk",
            Marketplace::DE => "https://www.amazon.de",
            Marketplace::FR => "https://www.amazon.fr",
            Marketplace::IT => "https://www.amazon.it",
            Marketplace::ES => "https://www.amazon.es",
            Marketplace::CA => "https://www.amazon.ca",
            Marketplace::JP => "https://www.amazon.co.jp",
            Marketplace::AU => "https://www.amazon.com.au",
            Marketplace::IN => "https://www.amazon.in",
            Marketplace::MX => "https://www.amazon.com.mx",
            Marketplace::BR => "https://www.amazon.com.br",
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Marketplace::US => "US",
            Marketplace::UK => "UK",
            Marketplace::DE => "DE",
            Marketplace::FR => "FR",
            Marketplace::IT => "IT",
            Marketplace::ES => "ES",
            Marketplace::CA => "CA",
            Marketplace::JP => "JP",
            Marketplace::AU => "AU",
            Marketplace::IN => "IN",
            Marketplace::MX => "MX",
            Marketplace::BR => "BR",
        }
    }

    /// Lenient lookup used for stored rows: unknown codes fall back to US.
    pub fn from_code_or_default(code: &str) -> Self {
        code.parse().unwrap_or_else(|_| {
            tracing::warn!("⚠️ Unknown marketplace '{}', falling back to US", code);
            Marketplace::US
        })
    }

    /// Search results URL for a keyword, e.g. `https://www.amazon.com/s?k=wireless%20headphones`.
    pub fn search_url(self, keyword: &str) -> String {
        format!("{}/s?k={}", self.base_url(), urlencoding::encode(keyword))
    }
}

impl FromStr for Marketplace {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        Marketplace::ALL
            .into_iter()
            .find(|m| m.code() == upper)
            .ok_or_else(|| anyhow::anyhow!("unknown marketplace '{}'", s))
    }
}

impl fmt::Display for Marketplace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingJob {
    pub id: Uuid,
    /// Owner of the job; proxies and notifications are scoped by it.
    pub user_scope: Uuid,
    /// Opaque catalog identifier (ASIN).
    pub target_id: String,
    pub marketplace: Marketplace,
    pub keywords: Vec<String>,
    pub frequency: TrackingFrequency,
    /// Random pause before each keyword search, in seconds.
    pub delay_range_secs: (u64, u64),
    pub status: JobStatus,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
}

impl TrackingJob {
    #[cfg(test)]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Active && self.next_run_at.map_or(true, |next| next <= now)
    }

    pub fn display_name(&self) -> String {
        format!("{} Tracking", self.target_id)
    }

    /// Keywords with duplicates removed, first occurrence wins.
    pub fn unique_keywords(&self) -> Vec<&str> {
        let mut seen = std::collections::HashSet::new();
        self.keywords
            .iter()
            .map(|k| k.as_str())
            .filter(|k| seen.insert(*k))
            .collect()
    }
}

// ============================================================================
// Position Samples
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CompetitionLevel {
    VeryLow,
    Low,
    Medium,
    High,
    Unknown,
}

impl CompetitionLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            CompetitionLevel::VeryLow => "very_low",
            CompetitionLevel::Low => "low",
            CompetitionLevel::Medium => "medium",
            CompetitionLevel::High => "high",
            CompetitionLevel::Unknown => "unknown",
        }
    }
}

impl FromStr for CompetitionLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "very_low" => Ok(CompetitionLevel::VeryLow),
            "low" => Ok(CompetitionLevel::Low),
            "medium" => Ok(CompetitionLevel::Medium),
            "high" => Ok(CompetitionLevel::High),
            "unknown" => Ok(CompetitionLevel::Unknown),
            other => Err(anyhow::anyhow!("unknown competition level '{}'", other)),
        }
    }
}

/// One observation of a (job, keyword) pair. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PositionSample {
    pub organic_position: Option<u32>,
    pub sponsored_position: Option<u32>,
    pub search_volume_estimate: Option<u32>,
    pub competition_level: CompetitionLevel,
    pub tracked_at: DateTime<Utc>,
}

impl PositionSample {
    /// Gap marker written when every fetch attempt for a keyword failed.
    pub fn failed(tracked_at: DateTime<Utc>) -> Self {
        Self {
            organic_position: None,
            sponsored_position: None,
            search_volume_estimate: None,
            competition_level: CompetitionLevel::Unknown,
            tracked_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    TrackingComplete,
    TrackingFailed,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::TrackingComplete => "tracking_complete",
            NotificationKind::TrackingFailed => "tracking_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_next_due_time() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(next_due_time(TrackingFrequency::Daily, t), t + Duration::hours(24));
        assert_eq!(next_due_time(TrackingFrequency::Weekly, t), t + Duration::days(7));
        assert_eq!(next_due_time(TrackingFrequency::Hourly, t), t + Duration::hours(1));
        assert_eq!(next_due_time(TrackingFrequency::Every6Hours, t), t + Duration::hours(6));
    }

    #[test]
    fn test_search_url_encodes_keyword() {
        assert_eq!(
            Marketplace::US.search_url("wireless headphones"),
            "https://www.amazon.com/s?k=wireless%20headphones"
        );
        assert_eq!(Marketplace::JP.search_url("a&b"), "https://www.amazon.co.jp/s?k=a%26b");
    }

    #[test]
    fn test_marketplace_lookup() {
        assert_eq!("uk".parse::<Marketplace>().unwrap(), Marketplace::UK);
        assert!("ZZ".parse::<Marketplace>().is_err());
        assert_eq!(Marketplace::from_code_or_default("ZZ"), Marketplace::US);
    }

    #[test]
    fn test_job_is_due() {
        let now = Utc::now();
        let mut job = TrackingJob {
            id: Uuid::new_v4(),
            user_scope: Uuid::new_v4(),
            target_id: "B08N5WRWNW".into(),
            marketplace: Marketplace::US,
            keywords: vec!["a".into(), "b".into(), "a".into()],
            frequency: TrackingFrequency::Daily,
            delay_range_secs: (2, 8),
            status: JobStatus::Active,
            last_run_at: None,
            next_run_at: None,
        };
        assert!(job.is_due(now));
        job.next_run_at = Some(now + Duration::minutes(1));
        assert!(!job.is_due(now));
        job.next_run_at = Some(now);
        assert!(job.is_due(now));
        job.status = JobStatus::Paused;
        assert!(!job.is_due(now));
        assert_eq!(job.unique_keywords(), vec!["a", "b"]);
    }
}
