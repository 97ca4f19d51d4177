//! Tool-name matchers for hook entries

use regex::Regex;

use crate::error::SwarmError;

/// Restricts a hook to specific tool names.
///
/// `None`, `""` and `"*"` match everything; `"read|write"` matches exact
/// names; anything else is an anchored regex.
#[derive(Debug, Clone)]
pub enum Matcher {
    All,
    Names(Vec<String>),
    Pattern(Regex),
}

impl Matcher {
    pub fn parse(pattern: Option<&str>) -> Result<Self, SwarmError> {
        let pattern = match pattern.map(str::trim) {
            None | Some("") | Some("*") => return Ok(Matcher::All),
            Some(p) => p,
        };

        let is_plain = pattern
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '|' | ':'));
        if is_plain {
            return Ok(Matcher::Names(
                pattern
                    .split('|')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            ));
        }

        Regex::new(&format!("^(?:{pattern})$"))
            .map(Matcher::Pattern)
            .map_err(|e| SwarmError::InvalidMatcher {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })
    }

    /// Events without a tool name are never filtered
    pub fn matches(&self, tool_name: Option<&str>) -> bool {
        let Some(name) = tool_name else {
            return true;
        };
        match self {
            Matcher::All => true,
            Matcher::Names(names) => names.iter().any(|n| n == name),
            Matcher::Pattern(re) => re.is_match(name),
        }
    }
}
