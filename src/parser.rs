use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use tracing::warn;

use crate::models::{CompetitionLevel, PositionSample};

static RESULT_COUNT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+(?:[,.]\d{3})*)\s*results?\b").unwrap());

/// Sponsored-container counts at or above which competition is rated.
#[derive(Debug, Clone, Copy)]
pub struct CompetitionThresholds {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl Default for CompetitionThresholds {
    fn default() -> Self {
        Self {
            high: 8,
            medium: 4,
            low: 1,
        }
    }
}

impl CompetitionThresholds {
    pub fn level(&self, sponsored: usize) -> CompetitionLevel {
        if sponsored >= self.high {
            CompetitionLevel::High
        } else if sponsored >= self.medium {
            CompetitionLevel::Medium
        } else if sponsored >= self.low {
            CompetitionLevel::Low
        } else {
            CompetitionLevel::VeryLow
        }
    }
}

/// Heuristic mapping from "N results" to a volume estimate.
#[derive(Debug, Clone, Copy)]
pub struct VolumeScale {
    pub divisor: u64,
    pub min: u64,
    pub max: u64,
}

impl Default for VolumeScale {
    fn default() -> Self {
        Self {
            divisor: 100,
            min: 100,
            max: 10_000,
        }
    }
}

impl VolumeScale {
    pub fn estimate(&self, result_count: u64) -> u32 {
        let scaled = result_count / self.divisor.max(1);
        scaled.clamp(self.min, self.max) as u32
    }
}

#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Every search result item carries this attribute with the item id.
    pub id_attribute: String,
    pub container_selector: String,
    /// Matches a container itself, or something inside it, when the item is an ad.
    pub sponsored_selector: String,
    pub result_count_selector: String,
    pub competition: CompetitionThresholds,
    pub volume: VolumeScale,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            id_attribute: "data-asin".to_string(),
            container_selector: "[data-asin]".to_string(),
            sponsored_selector: "[data-component-type=\"sp-sponsored-result\"], .AdHolder, \
                                 .puis-sponsored-label-text, .s-sponsored-label-text"
                .to_string(),
            result_count_selector: "[data-component-type=\"s-result-info-bar\"]".to_string(),
            competition: CompetitionThresholds::default(),
            volume: VolumeScale::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedResult {
    pub organic_position: Option<u32>,
    pub sponsored_position: Option<u32>,
    pub search_volume_estimate: Option<u32>,
    pub competition_level: CompetitionLevel,
}

impl ParsedResult {
    pub fn into_sample(self, tracked_at: DateTime<Utc>) -> PositionSample {
        PositionSample {
            organic_position: self.organic_position,
            sponsored_position: self.sponsored_position,
            search_volume_estimate: self.search_volume_estimate,
            competition_level: self.competition_level,
            tracked_at,
        }
    }
}

/// Search result item in document order.
#[derive(Debug)]
struct ResultItem<'a> {
    id: &'a str,
    sponsored: bool,
}

pub struct ResultParser {
    config: ParserConfig,
    container: Option<Selector>,
    sponsored: Option<Selector>,
    result_count: Option<Selector>,
}

impl ResultParser {
    pub fn new(config: ParserConfig) -> Self {
        let container = compile("container", &config.container_selector);
        let sponsored = compile("sponsored", &config.sponsored_selector);
        let result_count = compile("result count", &config.result_count_selector);
        Self {
            config,
            container,
            sponsored,
            result_count,
        }
    }

    /// Never fails as a whole: a field that cannot be extracted comes back
    /// as `None` / `Unknown`.
    pub fn parse(&self, html: &str, target_id: &str) -> ParsedResult {
        let document = Html::parse_document(html);

        let items = self.result_items(&document);
        let (organic_position, sponsored_position) = match &items {
            Some(items) => (
                position_of(items, target_id, false),
                position_of(items, target_id, true),
            ),
            None => (None, None),
        };
        let competition_level = match &items {
            Some(items) => self
                .config
                .competition
                .level(items.iter().filter(|i| i.sponsored).count()),
            None => CompetitionLevel::Unknown,
        };

        ParsedResult {
            organic_position,
            sponsored_position,
            search_volume_estimate: self.search_volume(&document),
            competition_level,
        }
    }

    fn result_items<'a>(&self, document: &'a Html) -> Option<Vec<ResultItem<'a>>> {
        let container = self.container.as_ref()?;
        let sponsored = self.sponsored.as_ref()?;
        let attr = self.config.id_attribute.as_str();

        let items = document
            .select(container)
            .filter_map(|el| {
                let id = el.value().attr(attr).map(str::trim).filter(|id| !id.is_empty())?;
                // Nested ids (carousels, variations) belong to their outer card.
                if has_identified_ancestor(el, attr) {
                    return None;
                }
                Some(ResultItem {
                    id,
                    sponsored: sponsored.matches(&el) || el.select(sponsored).next().is_some(),
                })
            })
            .collect();
        Some(items)
    }

    fn search_volume(&self, document: &Html) -> Option<u32> {
        let scoped = self
            .result_count
            .as_ref()
            .and_then(|sel| document.select(sel).next())
            .map(|el| el.text().collect::<Vec<_>>().join(" "));
        let count_in = |text: &str| -> Option<String> {
            let caps = RESULT_COUNT_RE.captures(text)?;
            Some(caps[1].to_string())
        };
        // A banner without a count (e.g. "Showing results for ...") is no reason to give up.
        let raw = scoped
            .as_deref()
            .and_then(count_in)
            .or_else(|| count_in(&document.root_element().text().collect::<Vec<_>>().join(" ")))?;

        let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
        let count: u64 = digits.parse().ok()?;
        Some(self.config.volume.estimate(count))
    }
}

impl Default for ResultParser {
    fn default() -> Self {
        Self::new(ParserConfig::default())
    }
}

fn compile(name: &str, selector: &str) -> Option<Selector> {
    match Selector::parse(selector) {
        Ok(sel) => Some(sel),
        Err(e) => {
            warn!("⚠️ [Parser] Invalid {} selector '{}': {:?}", name, selector, e);
            None
        }
    }
}

fn has_identified_ancestor(el: ElementRef<'_>, attr: &str) -> bool {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .any(|a| a.value().attr(attr).map_or(false, |v| !v.trim().is_empty()))
}

/// 1 + number of same-category items before the first match.
fn position_of(items: &[ResultItem<'_>], target_id: &str, sponsored: bool) -> Option<u32> {
    items
        .iter()
        .filter(|i| i.sponsored == sponsored)
        .position(|i| i.id == target_id)
        .map(|idx| idx as u32 + 1)
}
