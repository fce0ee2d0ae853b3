//! Path rewriting

use regex::Regex;

use crate::config::RewriteRule;
use crate::{Error, Result};

/// Ordered regex rewrite rules. The first rule whose pattern matches is
/// applied to its first occurrence; later rules are not consulted.
#[derive(Debug, Clone, Default)]
pub struct PathRewrite {
    rules: Vec<(Regex, String)>,
}

impl PathRewrite {
    /// Compile rewrite rules
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a pattern is not a valid regex.
    pub fn compile(rules: &[RewriteRule]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|rule| {
                Regex::new(&rule.pattern)
                    .map(|re| (re, rule.replacement.clone()))
                    .map_err(|e| {
                        Error::Config(format!("invalid rewrite pattern '{}': {e}", rule.pattern))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Whether any rules are configured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rewrite a request path. Unmatched paths pass through unchanged and an
    /// empty result becomes `/`.
    #[must_use]
    pub fn apply(&self, path: &str) -> String {
        let rewritten = self
            .rules
            .iter()
            .find(|(re, _)| re.is_match(path))
            .map_or_else(
                || path.to_string(),
                |(re, replacement)| re.replace(path, replacement.as_str()).into_owned(),
            );

        if rewritten.is_empty() {
            "/".to_string()
        } else if rewritten.starts_with('/') {
            rewritten
        } else {
            format!("/{rewritten}")
        }
    }
}
