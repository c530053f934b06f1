use tracing::warn;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecurityError {
    #[error("input rejected: {0}")]
    InputRejected(String),
}

// ===========================================================================
// InputSanitizer
// ===========================================================================

/// Checks free text submitted by visitors: contact messages, chat input,
/// article bodies.
///
/// Rejects over-long input, control characters other than newline, carriage
/// return and tab, and markup fragments commonly used for script injection.
#[derive(Debug, Clone)]
pub struct InputSanitizer {
    /// Maximum input length in characters.
    pub max_length: usize,
    /// Lowercase fragments that cause rejection.
    blocked_patterns: Vec<String>,
}

impl Default for InputSanitizer {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl InputSanitizer {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            blocked_patterns: vec![
                "<script".into(),
                "</script".into(),
                "javascript:".into(),
                "vbscript:".into(),
                "<iframe".into(),
                "onerror=".into(),
                "onload=".into(),
                "data:text/html".into(),
            ],
        }
    }

    /// Preset for the AI chat: markup checks plus common prompt-injection
    /// phrases.
    pub fn for_chat(max_length: usize) -> Self {
        let mut s = Self::new(max_length);
        for p in [
            "ignore previous instructions",
            "ignore all previous",
            "disregard your instructions",
            "system prompt:",
            "new instructions:",
        ] {
            s.add_pattern(p);
        }
        s
    }

    /// Add a custom blocked fragment (matched case-insensitively).
    pub fn add_pattern(&mut self, pattern: impl Into<String>) {
        self.blocked_patterns.push(pattern.into().to_lowercase());
    }

    /// Validate `input` and return it trimmed.
    pub fn sanitize(&self, input: &str) -> Result<String, SecurityError> {
        let trimmed = input.trim();
        let len = trimmed.chars().count();
        if len > self.max_length {
            return Err(SecurityError::InputRejected(format!(
                "input too long ({len} chars, max {})",
                self.max_length
            )));
        }

        if trimmed
            .chars()
            .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
        {
            return Err(SecurityError::InputRejected(
                "input contains control characters".into(),
            ));
        }

        let lower = trimmed.to_lowercase();
        let compact: String = lower.chars().filter(|c| !c.is_whitespace()).collect();
        for pattern in &self.blocked_patterns {
            let compact_pattern: String = pattern.chars().filter(|c| !c.is_whitespace()).collect();
            let hit = if pattern.contains(' ') {
                lower.contains(pattern.as_str())
            } else {
                compact.contains(&compact_pattern)
            };
            if hit {
                warn!(pattern = pattern.as_str(), "blocked pattern in user input");
                return Err(SecurityError::InputRejected(format!(
                    "input contains disallowed content `{pattern}`"
                )));
            }
        }

        Ok(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_text() {
        let s = InputSanitizer::default();
        let out = s.sanitize("  Hello!\nTwo adults, one child, Turkey in June.  ").unwrap();
        assert_eq!(out, "Hello!\nTwo adults, one child, Turkey in June.");
    }

    #[test]
    fn rejects_markup_even_with_spacing() {
        let s = InputSanitizer::default();
        assert!(s.sanitize("<SCRIPT>alert(1)</script>").is_err());
        assert!(s.sanitize("<img src=x onerror = alert(1)>").is_err());
        assert!(s.sanitize("java script:void(0)").is_err());
        assert!(s.sanitize("Download the voucher at 10:00").is_ok());
    }

    #[test]
    fn length_is_counted_in_chars() {
        let s = InputSanitizer::new(5);
        assert!(s.sanitize("привет").is_err());
        assert!(s.sanitize("тур").is_ok());
    }

    #[test]
    fn rejects_control_chars() {
        let s = InputSanitizer::default();
        assert!(s.sanitize("bad\u{0007}bell").is_err());
        assert!(s.sanitize("tab\tok").is_ok());
    }

    #[test]
    fn chat_preset_blocks_prompt_injection() {
        let s = InputSanitizer::for_chat(2_000);
        assert!(s.sanitize("Please IGNORE PREVIOUS INSTRUCTIONS and...").is_err());
        assert!(s.sanitize("Which beaches are best in May?").is_ok());
        assert!(InputSanitizer::default()
            .sanitize("ignore previous instructions")
            .is_ok());
    }
}
