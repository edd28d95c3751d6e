use regex::{Regex, RegexBuilder};
use thiserror::Error;

/// Placeholder → regex fragment. Braces match, brackets also capture.
const MACROS: &[(&str, &str)] = &[
    ("{digits}", "[0-9]+"),
    ("[digits]", "([0-9]+)"),
    ("{letters}", "[A-Za-z]+"),
    ("[letters]", "([A-Za-z]+)"),
    ("{alnum}", "[0-9A-Za-z]+"),
    ("[alnum]", "([0-9A-Za-z]+)"),
    ("{content}", ".*?"),
    ("[content]", "(.*?)"),
    ("{host}", "[^/:]+"),
    ("[host]", "([^/:]+)"),
    ("/*", "/.*"),
];

#[derive(Error, Debug)]
#[error("invalid rule pattern '{pattern}': {source}")]
pub struct RuleError {
    pub pattern: String,
    #[source]
    pub source: regex::Error,
}

/// Expand the placeholder macros in a rule into a plain regular expression
pub fn expand_macros(rule: &str) -> String {
    MACROS
        .iter()
        .fold(rule.to_string(), |acc, (placeholder, regex)| acc.replace(placeholder, regex))
}

/// A compiled URL rule.
///
/// Matching is case-insensitive and exact: the whole URL must match, not a substring.
#[derive(Debug, Clone)]
pub struct RulePattern {
    source: String,
    regex: Regex,
}

impl RulePattern {
    pub fn new(rule: &str) -> Result<Self, RuleError> {
        let expanded = expand_macros(rule);
        let regex = RegexBuilder::new(&format!("^(?:{})$", expanded))
            .case_insensitive(true)
            .build()
            .map_err(|source| RuleError {
                pattern: rule.to_string(),
                source,
            })?;

        Ok(Self {
            source: rule.to_string(),
            regex,
        })
    }

    /// The rule as it was registered
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, url: &str) -> bool {
        self.regex.is_match(url)
    }

    /// Captured groups of the bracketed placeholders, if `url` matches
    pub fn captures(&self, url: &str) -> Option<Vec<String>> {
        self.regex.captures(url).map(|caps| {
            caps.iter()
                .skip(1)
                .map(|group| group.map(|m| m.as_str().to_string()).unwrap_or_default())
                .collect()
        })
    }
}

/// Ordered collection of traversal rules
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    patterns: Vec<RulePattern>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, rule: &str) -> Result<(), RuleError> {
        self.patterns.push(RulePattern::new(rule)?);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether at least one rule matches `url`. An empty set matches nothing.
    pub fn allows(&self, url: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.is_match(url))
    }
}
