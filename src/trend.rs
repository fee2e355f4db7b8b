use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::models::PositionSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    New,
    Up,
    Down,
    Stable,
}

#[derive(Debug, Clone)]
pub struct TrendConfig {
    pub history_window_days: i64,
    pub delta_window_days: i64,
    /// Rank change (in places) that counts as movement; smaller is noise.
    pub movement_threshold: i64,
    /// Rank assumed when the item was not found at all.
    pub missing_rank: u32,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            history_window_days: 30,
            delta_window_days: 7,
            movement_threshold: 2,
            missing_rank: 999,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct KeywordAnalytics {
    pub keyword: String,
    pub current_organic_position: Option<u32>,
    pub current_sponsored_position: Option<u32>,
    pub trend: Trend,
    pub organic_trend: Trend,
    pub sponsored_trend: Trend,
    /// Previous minus current; positive means the item climbed.
    pub organic_change: Option<i64>,
    pub sponsored_change: Option<i64>,
    pub avg_organic_position: Option<u32>,
    pub avg_sponsored_position: Option<u32>,
    pub best_organic_position: Option<u32>,
    pub best_sponsored_position: Option<u32>,
    pub worst_organic_position: Option<u32>,
    pub worst_sponsored_position: Option<u32>,
    pub total_tracked: usize,
    pub delta_window_change: Option<i64>,
    pub last_tracked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct TrendSummary {
    pub improving: usize,
    pub declining: usize,
    pub stable: usize,
}

/// Stateless: every result is a function of the history passed in.
#[derive(Debug, Clone, Default)]
pub struct TrendAnalyzer {
    config: TrendConfig,
}

impl TrendAnalyzer {
    pub fn new(config: TrendConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TrendConfig {
        &self.config
    }

    /// Headline rank of a sample: organic, else sponsored, else the miss sentinel.
    pub fn effective_rank(&self, sample: &PositionSample) -> u32 {
        sample
            .organic_position
            .or(sample.sponsored_position)
            .unwrap_or(self.config.missing_rank)
    }

    pub fn classify(&self, previous: Option<&PositionSample>, current: &PositionSample) -> Trend {
        let Some(previous) = previous else {
            return Trend::New;
        };
        self.movement(self.effective_rank(previous), self.effective_rank(current))
    }

    /// Trend of one placement category between two samples.
    pub fn category_trend(&self, previous: Option<u32>, current: Option<u32>) -> Trend {
        match (previous, current) {
            (None, Some(_)) => Trend::New,
            (Some(prev), Some(cur)) => self.movement(prev, cur),
            _ => Trend::Stable,
        }
    }

    fn movement(&self, previous: u32, current: u32) -> Trend {
        let change = previous as i64 - current as i64;
        if change > self.config.movement_threshold {
            Trend::Up
        } else if change < -self.config.movement_threshold {
            Trend::Down
        } else {
            Trend::Stable
        }
    }

    /// Aggregates over the samples inside the lookback window ending at `now`.
    /// Input order does not matter. `None` when the window is empty.
    pub fn analyze(&self, keyword: &str, history: &[PositionSample], now: DateTime<Utc>) -> Option<KeywordAnalytics> {
        let window_start = now - Duration::days(self.config.history_window_days);
        let mut samples: Vec<&PositionSample> = history
            .iter()
            .filter(|s| s.tracked_at >= window_start && s.tracked_at <= now)
            .collect();
        if samples.is_empty() {
            return None;
        }
        samples.sort_by_key(|s| s.tracked_at);

        let current = *samples.last()?;
        let previous = samples.len().checked_sub(2).map(|i| samples[i]);

        let organic: Vec<u32> = samples.iter().filter_map(|s| s.organic_position).collect();
        let sponsored: Vec<u32> = samples.iter().filter_map(|s| s.sponsored_position).collect();

        let delta_start = now - Duration::days(self.config.delta_window_days);
        let recent: Vec<&PositionSample> = samples.iter().copied().filter(|s| s.tracked_at >= delta_start).collect();

        Some(KeywordAnalytics {
            keyword: keyword.to_string(),
            current_organic_position: current.organic_position,
            current_sponsored_position: current.sponsored_position,
            trend: self.classify(previous, current),
            organic_trend: match previous {
                Some(p) => self.category_trend(p.organic_position, current.organic_position),
                None => Trend::New,
            },
            sponsored_trend: match previous {
                Some(p) => self.category_trend(p.sponsored_position, current.sponsored_position),
                None => Trend::New,
            },
            organic_change: change(previous.and_then(|p| p.organic_position), current.organic_position),
            sponsored_change: change(previous.and_then(|p| p.sponsored_position), current.sponsored_position),
            avg_organic_position: rounded_mean(&organic),
            avg_sponsored_position: rounded_mean(&sponsored),
            best_organic_position: organic.iter().copied().min(),
            best_sponsored_position: sponsored.iter().copied().min(),
            worst_organic_position: organic.iter().copied().max(),
            worst_sponsored_position: sponsored.iter().copied().max(),
            total_tracked: samples.len(),
            delta_window_change: window_change(&recent),
            last_tracked_at: current.tracked_at,
        })
    }

    pub fn summarize(analytics: &[KeywordAnalytics]) -> TrendSummary {
        let mut summary = TrendSummary::default();
        for a in analytics {
            let up = a.organic_trend == Trend::Up || a.sponsored_trend == Trend::Up;
            let down = a.organic_trend == Trend::Down || a.sponsored_trend == Trend::Down;
            match (up, down) {
                (true, false) => summary.improving += 1,
                (false, true) => summary.declining += 1,
                _ => summary.stable += 1,
            }
        }
        summary
    }
}

fn change(previous: Option<u32>, current: Option<u32>) -> Option<i64> {
    Some(previous? as i64 - current? as i64)
}

fn rounded_mean(values: &[u32]) -> Option<u32> {
    if values.is_empty() {
        return None;
    }
    let sum: u64 = values.iter().map(|&v| v as u64).sum();
    Some((sum as f64 / values.len() as f64).round() as u32)
}

/// Oldest minus newest organic rank within the (sorted) window.
fn window_change(recent: &[&PositionSample]) -> Option<i64> {
    if recent.len() < 2 {
        return None;
    }
    let oldest = recent.first()?.organic_position?;
    let newest = recent.last()?.organic_position?;
    Some(oldest as i64 - newest as i64)
}

impl Trend {
    pub fn as_str(self) -> &'static str {
        match self {
            Trend::New => "new",
            Trend::Up => "up",
            Trend::Down => "down",
            Trend::Stable => "stable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CompetitionLevel;
    use chrono::TimeZone;

    fn sample(organic: Option<u32>, sponsored: Option<u32>, at: DateTime<Utc>) -> PositionSample {
        PositionSample {
            organic_position: organic,
            sponsored_position: sponsored,
            search_volume_estimate: None,
            competition_level: CompetitionLevel::Low,
            tracked_at: at,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 30, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_classify() {
        let analyzer = TrendAnalyzer::default();
        let at = now();
        let s = |p| sample(Some(p), None, at);

        assert_eq!(analyzer.classify(Some(&s(25)), &s(12)), Trend::Up);
        assert_eq!(analyzer.classify(Some(&s(12)), &s(25)), Trend::Down);
        assert_eq!(analyzer.classify(Some(&s(15)), &s(16)), Trend::Stable);
        assert_eq!(analyzer.classify(Some(&s(10)), &s(8)), Trend::Stable);
        assert_eq!(analyzer.classify(None, &s(40)), Trend::New);
        assert_eq!(analyzer.classify(None, &sample(None, None, at)), Trend::New);
    }

    #[test]
    fn test_classify_falls_back_to_sponsored_then_sentinel() {
        let analyzer = TrendAnalyzer::default();
        let at = now();
        assert_eq!(analyzer.effective_rank(&sample(None, Some(4), at)), 4);
        assert_eq!(analyzer.effective_rank(&sample(None, None, at)), 999);
        // Lost the listing entirely.
        assert_eq!(analyzer.classify(Some(&sample(Some(11), None, at)), &sample(None, None, at)), Trend::Down);
        // Found again as an ad.
        assert_eq!(analyzer.classify(Some(&sample(None, None, at)), &sample(None, Some(3), at)), Trend::Up);
    }

    #[test]
    fn test_category_trend() {
        let analyzer = TrendAnalyzer::default();
        assert_eq!(analyzer.category_trend(None, Some(5)), Trend::New);
        assert_eq!(analyzer.category_trend(Some(5), None), Trend::Stable);
        assert_eq!(analyzer.category_trend(None, None), Trend::Stable);
        assert_eq!(analyzer.category_trend(Some(9), Some(2)), Trend::Up);
    }

    #[test]
    fn test_analyze_aggregates_window() {
        let analyzer = TrendAnalyzer::default();
        let now = now();
        let history = vec![
            // Out of the 30-day window.
            sample(Some(1), None, now - Duration::days(40)),
            sample(Some(20), Some(5), now - Duration::days(20)),
            sample(Some(14), None, now - Duration::days(6)),
            sample(None, None, now - Duration::days(4)),
            sample(Some(9), Some(2), now - Duration::days(1)),
            sample(Some(10), Some(3), now - Duration::days(2)),
        ];

        let a = analyzer.analyze("wireless headphones", &history, now).unwrap();
        assert_eq!(a.total_tracked, 5);
        assert_eq!(a.current_organic_position, Some(9));
        assert_eq!(a.current_sponsored_position, Some(2));
        assert_eq!(a.organic_change, Some(1));
        assert_eq!(a.trend, Trend::Stable);
        assert_eq!(a.best_organic_position, Some(9));
        assert_eq!(a.worst_organic_position, Some(20));
        assert_eq!(a.avg_organic_position, Some(13)); // (20+14+10+9)/4 = 13.25
        assert_eq!(a.avg_sponsored_position, Some(3)); // (5+3+2)/3 = 3.33
        assert_eq!(a.delta_window_change, Some(5)); // 14 -> 9
        assert_eq!(a.last_tracked_at, now - Duration::days(1));
    }

    #[test]
    fn test_delta_needs_two_samples_with_organic_ends() {
        let analyzer = TrendAnalyzer::default();
        let now = now();
        let single = vec![sample(Some(5), None, now - Duration::days(1))];
        let a = analyzer.analyze("k", &single, now).unwrap();
        assert_eq!(a.delta_window_change, None);
        assert_eq!(a.trend, Trend::New);
        assert_eq!(a.organic_trend, Trend::New);

        let gap_at_end = vec![
            sample(Some(5), None, now - Duration::days(3)),
            sample(None, None, now - Duration::days(1)),
        ];
        assert_eq!(analyzer.analyze("k", &gap_at_end, now).unwrap().delta_window_change, None);
        assert!(analyzer.analyze("k", &[], now).is_none());
    }

    #[test]
    fn test_analyze_is_repeatable() {
        let analyzer = TrendAnalyzer::default();
        let now = now();
        let history: Vec<_> = (0..10)
            .map(|i| sample(Some(30 - i * 2), None, now - Duration::hours(i as i64 * 12)))
            .collect();
        let first = analyzer.analyze("k", &history, now);
        let second = analyzer.analyze("k", &history, now);
        assert_eq!(first, second);
    }

    #[test]
    fn test_summarize() {
        let analyzer = TrendAnalyzer::default();
        let now = now();
        let up = analyzer
            .analyze("up", &[sample(Some(20), None, now - Duration::days(2)), sample(Some(5), None, now)], now)
            .unwrap();
        let down = analyzer
            .analyze("down", &[sample(Some(5), None, now - Duration::days(2)), sample(Some(20), None, now)], now)
            .unwrap();
        let mixed = analyzer
            .analyze(
                "mixed",
                &[
                    sample(Some(20), Some(1), now - Duration::days(2)),
                    sample(Some(5), Some(9), now),
                ],
                now,
            )
            .unwrap();
        let summary = TrendAnalyzer::summarize(&[up, down, mixed]);
        assert_eq!(summary, TrendSummary { improving: 1, declining: 1, stable: 1 });
    }
}
