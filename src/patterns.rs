/// Named pattern matching over message text.
///
/// Each pattern is a case-insensitive regex searched anywhere in the text.
/// A message matches a name at most once no matter how many segments hit it.
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Name reported when a filtered pattern is found in `TrackSeparately` mode.
pub const FILTERED: &str = "filtered";

/// How filtered patterns affect a message's matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// Count filtered messages under the `filtered` pseudo-pattern.
    #[default]
    TrackSeparately,
    /// A filtered message matches nothing.
    Exclude,
    /// Ignore the filtered patterns entirely.
    ShowAll,
}

/// Compiled set of named patterns.
#[derive(Debug)]
pub struct PatternMatcher {
    tracked: Vec<(String, Regex)>,
    filtered: Vec<Regex>,
    mode: FilterMode,
}

impl PatternMatcher {
    /// Compile every pattern once. An invalid regex is a configuration error.
    pub fn new(
        patterns: &BTreeMap<String, String>,
        filtered: &BTreeMap<String, String>,
        mode: FilterMode,
    ) -> Result<Self, PatternError> {
        let tracked = patterns
            .iter()
            .map(|(name, source)| compile(name, source).map(|re| (name.clone(), re)))
            .collect::<Result<Vec<_>, _>>()?;
        let filtered = filtered
            .iter()
            .map(|(name, source)| compile(name, source))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            tracked,
            filtered,
            mode,
        })
    }

    /// Names of all counters this matcher can report, in stable order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tracked.iter().map(|(n, _)| n.clone()).collect();
        if self.reports_filtered() {
            names.push(FILTERED.to_string());
        }
        names
    }

    /// Names whose pattern occurs anywhere in `text`.
    pub fn matches(&self, text: &str) -> BTreeSet<String> {
        self.matches_any(std::iter::once(text))
    }

    /// Union of matched names over every segment of one message.
    pub fn matches_any<'a, I>(&self, segments: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut matched = BTreeSet::new();
        let mut hit_filter = false;

        for text in segments {
            for (name, re) in &self.tracked {
                if !matched.contains(name) && re.is_match(text) {
                    matched.insert(name.clone());
                }
            }
            if self.mode != FilterMode::ShowAll
                && !hit_filter
                && self.filtered.iter().any(|re| re.is_match(text))
            {
                hit_filter = true;
            }
        }

        if hit_filter {
            match self.mode {
                FilterMode::TrackSeparately => {
                    matched.insert(FILTERED.to_string());
                }
                FilterMode::Exclude => matched.clear(),
                FilterMode::ShowAll => {}
            }
        }

        matched
    }

    fn reports_filtered(&self) -> bool {
        self.mode == FilterMode::TrackSeparately && !self.filtered.is_empty()
    }
}

fn compile(name: &str, source: &str) -> Result<Regex, PatternError> {
    RegexBuilder::new(source)
        .case_insensitive(true)
        .build()
        .map_err(|e| PatternError {
            name: name.to_string(),
            source: e,
        })
}

/// A pattern failed to compile.
#[derive(Debug)]
pub struct PatternError {
    pub name: String,
    pub source: regex::Error,
}

impl std::fmt::Display for PatternError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid pattern '{}': {}", self.name, self.source)
    }
}

impl std::error::Error for PatternError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn affirmations() -> PatternMatcher {
        PatternMatcher::new(
            &map(&[
                ("absolutely", r"You(?:'re| are) absolutely right"),
                ("right", r"You(?:'re| are) right"),
                ("perfect", r"Perfect!"),
            ]),
            &BTreeMap::new(),
            FilterMode::default(),
        )
        .unwrap()
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn matches_anywhere_in_text() {
        let m = affirmations();
        assert_eq!(
            m.matches("Ah, you're right. Let me fix that."),
            set(&["right"])
        );
    }

    #[test]
    fn matching_is_case_insensitive() {
        let m = affirmations();
        assert_eq!(
            m.matches("YOU ARE ABSOLUTELY RIGHT"),
            set(&["absolutely"])
        );
        assert_eq!(m.matches("perfect! done"), set(&["perfect"]));
    }

    #[test]
    fn several_names_can_match_one_text() {
        let m = affirmations();
        assert_eq!(
            m.matches("You're right! Perfect!"),
            set(&["right", "perfect"])
        );
    }

    #[test]
    fn no_match_is_empty() {
        let m = affirmations();
        assert!(m.matches("I disagree with that approach.").is_empty());
        assert!(m.matches("").is_empty());
    }

    #[test]
    fn matches_any_unions_segments() {
        let m = affirmations();
        let got = m.matches_any(["You're absolutely right", "Perfect!", "Perfect!"]);
        assert_eq!(got, set(&["absolutely", "perfect"]));
    }

    #[test]
    fn invalid_regex_names_the_pattern() {
        let err = PatternMatcher::new(
            &map(&[("broken", r"(unclosed")]),
            &BTreeMap::new(),
            FilterMode::default(),
        )
        .unwrap_err();
        assert_eq!(err.name, "broken");
        assert!(err.to_string().contains("invalid pattern 'broken'"));
    }

    #[test]
    fn invalid_filter_regex_is_an_error() {
        let result = PatternMatcher::new(
            &map(&[("ok", "fine")]),
            &map(&[("bad", "[")]),
            FilterMode::Exclude,
        );
        assert!(result.is_err());
    }

    fn words(mode: FilterMode) -> PatternMatcher {
        PatternMatcher::new(
            &map(&[("please", r"\bplease\b"), ("thanks", r"\bthanks\b")]),
            &map(&[("swear", r"\bdarn\b")]),
            mode,
        )
        .unwrap()
    }

    #[test]
    fn track_separately_adds_filtered() {
        let m = words(FilterMode::TrackSeparately);
        assert_eq!(
            m.matches_any(["please fix", "darn it"]),
            set(&["please", "filtered"])
        );
        assert_eq!(m.names(), vec!["please", "thanks", "filtered"]);
    }

    #[test]
    fn exclude_drops_all_matches() {
        let m = words(FilterMode::Exclude);
        assert!(m.matches("please, darn").is_empty());
        assert_eq!(m.matches("thanks"), set(&["thanks"]));
        assert_eq!(m.names(), vec!["please", "thanks"]);
    }

    #[test]
    fn show_all_ignores_filters() {
        let m = words(FilterMode::ShowAll);
        assert_eq!(m.matches("please, darn"), set(&["please"]));
    }

    #[test]
    fn filter_mode_parses_snake_case() {
        let mode: FilterMode = serde_json::from_str(r#""track_separately""#).unwrap();
        assert_eq!(mode, FilterMode::TrackSeparately);
        let mode: FilterMode = serde_json::from_str(r#""show_all""#).unwrap();
        assert_eq!(mode, FilterMode::ShowAll);
    }
}
