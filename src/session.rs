use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
        }
    }
}

/// Cookie jar reused across consecutive requests of one job.
///
/// Never shared between jobs: each job run builds its own.
#[derive(Debug)]
pub struct SessionState {
    /// `name=value` pairs in first-seen order.
    cookies: Vec<(String, String)>,
    started_at: Instant,
    timeout: Duration,
    rotations: u32,
}

impl SessionState {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            cookies: Vec::new(),
            started_at: Instant::now(),
            timeout: config.timeout,
            rotations: 0,
        }
    }

    /// Value for a `Cookie` request header, if the jar holds anything.
    pub fn current(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_stale(&self) -> bool {
        self.age() > self.timeout
    }

    pub fn rotate(&mut self) {
        self.cookies.clear();
        self.started_at = Instant::now();
        self.rotations += 1;
        debug!("🔄 [Session] Rotated (total rotations: {})", self.rotations);
    }

    pub fn rotation_count(&self) -> u32 {
        self.rotations
    }

    /// Merge `Set-Cookie` header values into the jar. Attributes such as
    /// `Path` or `Expires` are dropped; a cookie with an empty value is removed.
    pub fn absorb_set_cookies<S: AsRef<str>>(&mut self, headers: &[S]) {
        for header in headers {
            let Some((name, value)) = parse_set_cookie(header.as_ref()) else {
                continue;
            };
            let existing = self.cookies.iter().position(|(n, _)| n == name);
            match (existing, value.is_empty()) {
                (Some(idx), true) => {
                    self.cookies.remove(idx);
                }
                (Some(idx), false) => self.cookies[idx].1 = value.to_string(),
                (None, false) => self.cookies.push((name.to_string(), value.to_string())),
                (None, true) => {}
            }
        }
    }
}

fn parse_set_cookie(header: &str) -> Option<(&str, &str)> {
    let pair = header.split(';').next()?.trim();
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name, value.trim().trim_matches('"')))
}
