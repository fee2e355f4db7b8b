//! Usage counters derived from the request log.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use utoipa::ToSchema;

use crate::store::RequestLogEntry;

/// Oldest day counted, relative to the start of today.
pub const USAGE_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct MarketplaceUsage {
    pub requests: u64,
    pub failed: u64,
    pub data_used: u64,
}

/// Bytes received per window plus request counts over the whole window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct UsageStats {
    pub today_usage: u64,
    pub week_usage: u64,
    pub month_usage: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub by_marketplace: BTreeMap<String, MarketplaceUsage>,
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| Utc.from_utc_datetime(&midnight))
        .unwrap_or(now)
}

/// First instant the month window covers.
pub fn usage_window_start(now: DateTime<Utc>) -> DateTime<Utc> {
    start_of_day(now) - Duration::days(USAGE_WINDOW_DAYS)
}

pub fn summarize_usage(entries: &[RequestLogEntry], now: DateTime<Utc>) -> UsageStats {
    let today = start_of_day(now);
    let week_ago = today - Duration::days(7);
    let month_ago = usage_window_start(now);

    let mut stats = UsageStats::default();
    for entry in entries.iter().filter(|e| e.requested_at >= month_ago) {
        if entry.requested_at >= today {
            stats.today_usage += entry.data_used;
        }
        if entry.requested_at >= week_ago {
            stats.week_usage += entry.data_used;
        }
        stats.month_usage += entry.data_used;
        stats.total_requests += 1;

        let market = stats
            .by_marketplace
            .entry(entry.marketplace.code().to_string())
            .or_default();
        market.requests += 1;
        market.data_used += entry.data_used;
        if !entry.success {
            stats.failed_requests += 1;
            market.failed += 1;
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Marketplace;
    use uuid::Uuid;

    fn entry(marketplace: Marketplace, success: bool, data_used: u64, at: DateTime<Utc>) -> RequestLogEntry {
        RequestLogEntry {
            job_id: Uuid::nil(),
            user_scope: Uuid::nil(),
            keyword: "desk lamp".to_string(),
            marketplace,
            success,
            error_message: (!success).then(|| "HTTP 503".to_string()),
            user_agent: None,
            response_time_ms: 120,
            data_used,
            requested_at: at,
        }
    }

    #[test]
    fn test_windows_and_marketplace_breakdown() {
        let now = Utc.with_ymd_and_hms(2024, 3, 20, 15, 0, 0).unwrap();
        let entries = vec![
            entry(Marketplace::US, true, 100, now - Duration::hours(1)),
            entry(Marketplace::US, false, 0, now - Duration::hours(2)),
            entry(Marketplace::DE, true, 50, now - Duration::days(3)),
            entry(Marketplace::DE, true, 25, now - Duration::days(20)),
            entry(Marketplace::US, true, 999, now - Duration::days(45)),
        ];

        let stats = summarize_usage(&entries, now);
        assert_eq!(stats.today_usage, 100);
        assert_eq!(stats.week_usage, 150);
        assert_eq!(stats.month_usage, 175);
        assert_eq!(stats.total_requests, 4);
        assert_eq!(stats.failed_requests, 1);
        assert_eq!(
            stats.by_marketplace["US"],
            MarketplaceUsage {
                requests: 2,
                failed: 1,
                data_used: 100
            }
        );
        assert_eq!(stats.by_marketplace["DE"].requests, 2);
    }

    #[test]
    fn test_today_starts_at_midnight_utc() {
        let now = Utc.with_ymd_and_hms(2024, 3, 20, 0, 30, 0).unwrap();
        let stats = summarize_usage(&[entry(Marketplace::UK, true, 10, now - Duration::hours(1))], now);
        assert_eq!(stats.today_usage, 0);
        assert_eq!(stats.week_usage, 10);
        assert_eq!(usage_window_start(now), Utc.with_ymd_and_hms(2024, 2, 19, 0, 0, 0).unwrap());
    }
}
