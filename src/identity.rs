use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserFamily {
    Chrome,
    Edge,
    Firefox,
    Safari,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOs,
    Ios,
    Android,
}

impl Platform {
    fn client_hint(self) -> &'static str {
        match self {
            Platform::Windows => "\"Windows\"",
            Platform::MacOs => "\"macOS\"",
            Platform::Ios => "\"iOS\"",
            Platform::Android => "\"Android\"",
        }
    }

    fn is_mobile(self) -> bool {
        matches!(self, Platform::Ios | Platform::Android)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UserAgentProfile {
    pub user_agent: &'static str,
    pub family: BrowserFamily,
    pub platform: Platform,
    /// Major version, used to build `Sec-Ch-Ua` for Chromium browsers.
    pub version: u16,
}

static USER_AGENTS: Lazy<Vec<UserAgentProfile>> = Lazy::new(|| {
    use BrowserFamily::*;
    use Platform::*;
    vec![
        UserAgentProfile {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
            family: Chrome, platform: Windows, version: 123,
        },
        UserAgentProfile {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
            family: Chrome, platform: Windows, version: 122,
        },
        UserAgentProfile {
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
            family: Chrome, platform: MacOs, version: 123,
        },
        UserAgentProfile {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:124.0) Gecko/20100101 Firefox/124.0",
            family: Firefox, platform: Windows, version: 124,
        },
        UserAgentProfile {
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:124.0) Gecko/20100101 Firefox/124.0",
            family: Firefox, platform: MacOs, version: 124,
        },
        UserAgentProfile {
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
            family: Safari, platform: MacOs, version: 17,
        },
        UserAgentProfile {
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
            family: Safari, platform: MacOs, version: 17,
        },
        UserAgentProfile {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36 Edg/123.0.0.0",
            family: Edge, platform: Windows, version: 123,
        },
        UserAgentProfile {
            user_agent: "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1",
            family: Safari, platform: Ios, version: 17,
        },
        UserAgentProfile {
            user_agent: "Mozilla/5.0 (Linux; Android 14; SM-S911B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Mobile Safari/537.36",
            family: Chrome, platform: Android, version: 123,
        },
        UserAgentProfile {
            user_agent: "Mozilla/5.0 (Linux; Android 13; SM-G991B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Mobile Safari/537.36",
            family: Chrome, platform: Android, version: 122,
        },
    ]
});

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    /// Spacing between consecutive requests, drawn per call from [min, max].
    pub interval_min_ms: u64,
    pub interval_max_ms: u64,
    pub accept_languages: Vec<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            interval_min_ms: 2_000,
            interval_max_ms: 8_000,
            accept_languages: vec![
                "en-US,en;q=0.9".to_string(),
                "en-US,en;q=0.8".to_string(),
                "en-GB,en;q=0.9,en-US;q=0.8".to_string(),
            ],
        }
    }
}

/// A client disguise for one request: the agent plus headers a real browser
/// of that family would send alongside it.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_agent: &'static str,
    pub family: BrowserFamily,
    pub headers: Vec<(&'static str, String)>,
}

impl Identity {
    #[cfg(test)]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct IdentityRotator {
    config: IdentityConfig,
}

impl IdentityRotator {
    pub fn new(config: IdentityConfig) -> Self {
        Self { config }
    }

    #[cfg(test)]
    pub fn profiles() -> &'static [UserAgentProfile] {
        &USER_AGENTS
    }

    pub fn next_identity<R: Rng>(&self, rng: &mut R) -> Identity {
        let profile = *USER_AGENTS.choose(rng).unwrap_or(&USER_AGENTS[0]);
        let language = self
            .config
            .accept_languages
            .choose(rng)
            .cloned()
            .unwrap_or_else(|| "en-US,en;q=0.9".to_string());
        Identity {
            user_agent: profile.user_agent,
            family: profile.family,
            headers: build_headers(&profile, language),
        }
    }

    pub fn minimum_interval<R: Rng>(&self, rng: &mut R) -> Duration {
        let ms = rng.gen_range(self.config.interval_min_ms..=self.config.interval_max_ms);
        Duration::from_millis(ms)
    }
}

fn build_headers(profile: &UserAgentProfile, language: String) -> Vec<(&'static str, String)> {
    let accept = match profile.family {
        BrowserFamily::Chrome | BrowserFamily::Edge => {
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7"
        }
        BrowserFamily::Firefox => {
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8"
        }
        BrowserFamily::Safari => "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
    };

    let mut headers = vec![
        ("User-Agent", profile.user_agent.to_string()),
        ("Accept", accept.to_string()),
        ("Accept-Language", language),
        ("Accept-Encoding", "gzip, deflate, br".to_string()),
        ("Cache-Control", "no-cache".to_string()),
        ("Pragma", "no-cache".to_string()),
        ("Upgrade-Insecure-Requests", "1".to_string()),
    ];

    // Client hints only exist in Chromium browsers.
    match profile.family {
        BrowserFamily::Chrome | BrowserFamily::Edge => {
            let brand = if profile.family == BrowserFamily::Edge {
                "Microsoft Edge"
            } else {
                "Google Chrome"
            };
            headers.push((
                "Sec-Ch-Ua",
                format!(
                    "\"Chromium\";v=\"{v}\", \"{brand}\";v=\"{v}\", \"Not-A.Brand\";v=\"99\"",
                    v = profile.version,
                    brand = brand
                ),
            ));
            headers.push((
                "Sec-Ch-Ua-Mobile",
                if profile.platform.is_mobile() { "?1" } else { "?0" }.to_string(),
            ));
            headers.push(("Sec-Ch-Ua-Platform", profile.platform.client_hint().to_string()));
        }
        BrowserFamily::Firefox | BrowserFamily::Safari => {}
    }

    headers.extend([
        ("Sec-Fetch-Dest", "document".to_string()),
        ("Sec-Fetch-Mode", "navigate".to_string()),
        ("Sec-Fetch-Site", "none".to_string()),
        ("Sec-Fetch-User", "?1".to_string()),
    ]);
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    #[test]
    fn test_pool_spans_families_and_platforms() {
        let families: HashSet<_> = IdentityRotator::profiles().iter().map(|p| format!("{:?}", p.family)).collect();
        let platforms: HashSet<_> = IdentityRotator::profiles().iter().map(|p| format!("{:?}", p.platform)).collect();
        assert!(families.len() >= 3);
        assert!(platforms.len() >= 2);
    }

    #[test]
    fn test_headers_match_browser_family() {
        let rotator = IdentityRotator::default();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let identity = rotator.next_identity(&mut rng);
            assert_eq!(identity.header("user-agent"), Some(identity.user_agent));
            assert_eq!(identity.header("Sec-Fetch-Mode"), Some("navigate"));
            assert!(identity.header("Accept-Language").is_some());
            let chromium = matches!(identity.family, BrowserFamily::Chrome | BrowserFamily::Edge);
            assert_eq!(identity.header("Sec-Ch-Ua").is_some(), chromium, "{}", identity.user_agent);
            if identity.user_agent.contains("Mobile") && chromium {
                assert_eq!(identity.header("Sec-Ch-Ua-Mobile"), Some("?1"));
            }
        }
    }

    #[test]
    fn test_same_seed_same_identity() {
        let rotator = IdentityRotator::default();
        let a = rotator.next_identity(&mut StdRng::seed_from_u64(99));
        let b = rotator.next_identity(&mut StdRng::seed_from_u64(99));
        assert_eq!(a.user_agent, b.user_agent);
        assert_eq!(a.headers, b.headers);
    }

    #[test]
    fn test_minimum_interval_within_range() {
        let rotator = IdentityRotator::default();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..200 {
            let d = rotator.minimum_interval(&mut rng);
            assert!(d >= Duration::from_secs(2) && d <= Duration::from_secs(8));
        }

        let fixed = IdentityRotator::new(IdentityConfig {
            interval_min_ms: 500,
            interval_max_ms: 500,
            ..IdentityConfig::default()
        });
        assert_eq!(fixed.minimum_interval(&mut rng), Duration::from_millis(500));
    }
}
