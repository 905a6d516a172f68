use std::time::Duration;

use regex::Regex;

/// Value reported by [`ReadinessRule::observe`] for patterns without a capture group.
pub const MATCHED: &str = "matched";

/// A pattern to look for in a child's output, plus how long to wait for it.
#[derive(Debug, Clone)]
pub struct ReadinessRule {
    pattern: Regex,
    timeout: Duration,
}

impl ReadinessRule {
    pub fn new(pattern: &str, timeout: Duration) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            timeout,
        })
    }

    /// Matches lines ending with `literal` (trailing whitespace ignored).
    pub fn suffix(literal: &str, timeout: Duration) -> Result<Self, regex::Error> {
        Self::new(&format!("{}\\s*$", regex::escape(literal)), timeout)
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Matches a single physical line. Returns the first capture group, or
    /// [`MATCHED`] when the pattern has none.
    pub fn observe(&self, line: &str) -> Option<String> {
        let caps = self.pattern.captures(line)?;
        if self.pattern.captures_len() < 2 {
            return Some(MATCHED.to_string());
        }
        Some(
            caps.get(1)
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| MATCHED.to_string()),
        )
    }
}
