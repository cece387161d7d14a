#![deny(clippy::all)]
//! Resolution of environment-variable declarations against the process
//! environment.
//!
//! Declarations are either literal names or wildcard patterns (`*` matches
//! any run of characters, `\*` escapes a literal star, a leading `!` marks
//! an exclusion, `\!` escapes a literal leading bang). Resolution produces
//! inclusions minus exclusions, always in sorted order. A declared literal
//! that is unset in the environment still appears, with an empty value, so
//! hashes can distinguish declared-but-unset from undeclared.

use std::{
    collections::BTreeMap,
    env,
    ops::{Deref, DerefMut},
};

use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("invalid environment variable pattern: {0}")]
    Regex(#[from] regex::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct EnvironmentVariableMap(BTreeMap<String, String>);

/// A list of `NAME=value` strings, sorted by construction since the
/// underlying map is ordered.
pub type EnvironmentVariablePairs = Vec<String>;

// BySource breaks down a resolved map by where each variable came from.
#[derive(Clone, Debug, Default, Serialize)]
pub struct BySource {
    pub explicit: EnvironmentVariableMap,
    pub matching: EnvironmentVariableMap,
}

// DetailedMap holds the composite map plus the by-source breakdown. `all`
// feeds task hashing; `by_source` feeds dry runs and run summaries.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DetailedMap {
    pub all: EnvironmentVariableMap,
    pub by_source: BySource,
}

// A pair of maps produced by processing wildcard declarations: what the
// patterns pulled in, and what the `!` patterns push back out.
#[derive(Debug)]
pub struct WildcardMaps {
    pub inclusions: EnvironmentVariableMap,
    pub exclusions: EnvironmentVariableMap,
}

impl WildcardMaps {
    // Collapses the pair into a single map.
    fn resolve(self) -> EnvironmentVariableMap {
        let mut output = self.inclusions;
        output.difference(&self.exclusions);
        output
    }
}

impl From<BTreeMap<String, String>> for EnvironmentVariableMap {
    fn from(map: BTreeMap<String, String>) -> Self {
        EnvironmentVariableMap(map)
    }
}

impl FromIterator<(String, String)> for EnvironmentVariableMap {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        EnvironmentVariableMap(iter.into_iter().collect())
    }
}

impl Deref for EnvironmentVariableMap {
    type Target = BTreeMap<String, String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for EnvironmentVariableMap {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl EnvironmentVariableMap {
    /// Snapshot of the entire process environment.
    pub fn infer() -> Self {
        EnvironmentVariableMap(env::vars().collect())
    }

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.0
    }

    pub fn names(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    /// Sorted `NAME=value` pairs with plaintext values.
    pub fn to_hashable(&self) -> EnvironmentVariablePairs {
        self.0.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    /// Sorted `NAME=` or `NAME=sha256(value)` pairs. Values never enter a
    /// fingerprint in plaintext.
    pub fn to_secret_hashable(&self) -> EnvironmentVariablePairs {
        self.0
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    format!("{k}=")
                } else {
                    let mut hasher = Sha256::new();
                    hasher.update(v.as_bytes());
                    format!("{k}={}", hex::encode(hasher.finalize()))
                }
            })
            .collect()
    }

    // Adds `another` into self, overwriting existing values.
    pub fn union(&mut self, another: &EnvironmentVariableMap) {
        for (key, value) in &another.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    // Removes keys present in `another` from self.
    pub fn difference(&mut self, another: &EnvironmentVariableMap) {
        for key in another.0.keys() {
            self.0.remove(key);
        }
    }

    /// Resolves wildcard declarations to the matching subset of this map.
    pub fn from_wildcards(
        &self,
        wildcard_patterns: &[impl AsRef<str>],
    ) -> Result<EnvironmentVariableMap, Error> {
        if wildcard_patterns.is_empty() {
            return Ok(EnvironmentVariableMap::default());
        }
        Ok(self.wildcard_maps(wildcard_patterns)?.resolve())
    }

    /// Like `from_wildcards`, but keeps inclusions and exclusions separate
    /// so caller-supplied exclusions can take primacy over inferred
    /// inclusions.
    pub fn wildcard_maps_unresolved(
        &self,
        wildcard_patterns: &[impl AsRef<str>],
    ) -> Result<WildcardMaps, Error> {
        if wildcard_patterns.is_empty() {
            return Ok(WildcardMaps {
                inclusions: EnvironmentVariableMap::default(),
                exclusions: EnvironmentVariableMap::default(),
            });
        }
        self.wildcard_maps(wildcard_patterns)
    }

    fn wildcard_maps(&self, wildcard_patterns: &[impl AsRef<str>]) -> Result<WildcardMaps, Error> {
        let mut output = WildcardMaps {
            inclusions: EnvironmentVariableMap::default(),
            exclusions: EnvironmentVariableMap::default(),
        };

        let mut include_patterns = Vec::new();
        let mut exclude_patterns = Vec::new();

        for wildcard_pattern in wildcard_patterns {
            let wildcard_pattern = wildcard_pattern.as_ref();
            if let Some(rest) = wildcard_pattern.strip_prefix('!') {
                exclude_patterns.push(CompiledPattern::new(rest));
            } else if let Some(rest) = wildcard_pattern.strip_prefix("\\!") {
                include_patterns.push(CompiledPattern::new(&format!("!{rest}")));
            } else {
                include_patterns.push(CompiledPattern::new(wildcard_pattern));
            }
        }

        let include_regex = joined_regex(&include_patterns)?;
        let exclude_regex = joined_regex(&exclude_patterns)?;

        for (env_var, env_value) in &self.0 {
            if include_regex
                .as_ref()
                .map_or(false, |re| re.is_match(env_var))
            {
                output.inclusions.insert(env_var.clone(), env_value.clone());
            }
            if exclude_regex
                .as_ref()
                .map_or(false, |re| re.is_match(env_var))
            {
                output.exclusions.insert(env_var.clone(), env_value.clone());
            }
        }

        // A declared literal that is unset still contributes an entry, so a
        // fingerprint can tell declared-but-unset apart from undeclared.
        for pattern in &include_patterns {
            if let Some(name) = pattern.literal() {
                output
                    .inclusions
                    .entry(name.to_string())
                    .or_insert_with(String::new);
            }
        }

        Ok(output)
    }
}

struct CompiledPattern {
    regex_pattern: String,
    literal: Option<String>,
}

impl CompiledPattern {
    fn new(pattern: &str) -> Self {
        let (regex_pattern, saw_wildcard) = wildcard_to_regex_pattern(pattern);
        let literal = (!saw_wildcard).then(|| pattern.replace("\\*", "*"));
        Self {
            regex_pattern,
            literal,
        }
    }

    fn literal(&self) -> Option<&str> {
        self.literal.as_deref()
    }
}

fn joined_regex(patterns: &[CompiledPattern]) -> Result<Option<Regex>, Error> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let joined = patterns
        .iter()
        .map(|p| p.regex_pattern.as_str())
        .collect::<Vec<_>>()
        .join("|");
    Ok(Some(Regex::new(&format!("^({joined})$"))?))
}

const WILDCARD: char = '*';
const WILDCARD_ESCAPE: char = '\\';
const REGEX_WILDCARD_SEGMENT: &str = ".*";

/// Translates a wildcard pattern to a regex fragment, reporting whether an
/// unescaped wildcard was present.
fn wildcard_to_regex_pattern(pattern: &str) -> (String, bool) {
    let mut regex_string = Vec::new();
    let mut previous_index = 0;
    let mut previous_char: Option<char> = None;
    let mut saw_wildcard = false;

    for (i, char) in pattern.char_indices() {
        if char == WILDCARD {
            if previous_char == Some(WILDCARD_ESCAPE) {
                // Literal *: replace the trailing "\*" with "*" before
                // escaping the segment.
                regex_string.push(regex::escape(&format!(
                    "{}*",
                    &pattern[previous_index..(i - 1)]
                )));
            } else {
                saw_wildcard = true;
                // Static segment since the last wildcard; can be empty.
                regex_string.push(regex::escape(&pattern[previous_index..i]));

                // Collapse adjacent dynamic segments.
                if regex_string.last().map(String::as_str) != Some(REGEX_WILDCARD_SEGMENT) {
                    regex_string.push(REGEX_WILDCARD_SEGMENT.to_string());
                }
            }

            previous_index = i + 1;
        }
        previous_char = Some(char);
    }

    // The final static segment; can be empty.
    regex_string.push(regex::escape(&pattern[previous_index..]));

    (regex_string.join(""), saw_wildcard)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn test_env() -> EnvironmentVariableMap {
        [
            ("FOO_12_BAR", "a"),
            ("FOO__BAR", "b"),
            ("FOOBAR", "c"),
            ("LITERAL_*", "lit"),
            ("NODE_ENV", "production"),
            ("CI", "true"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test_case(&["FOO_*_BAR"], &["FOO_12_BAR", "FOO__BAR"] ; "infix wildcard")]
    #[test_case(&["LITERAL_\\*"], &["LITERAL_*"] ; "escaped star is literal")]
    #[test_case(&["FOO*", "!FOOBAR"], &["FOO_12_BAR", "FOO__BAR"] ; "exclusion")]
    #[test_case(&["NODE_ENV", "CI"], &["CI", "NODE_ENV"] ; "literals sorted")]
    fn test_from_wildcards(patterns: &[&str], expected: &[&str]) {
        let resolved = test_env().from_wildcards(patterns).unwrap();
        assert_eq!(resolved.names(), expected);
    }

    #[test]
    fn test_wildcard_does_not_match_shorter() {
        let resolved = test_env().from_wildcards(&["FOO_*_BAR"]).unwrap();
        assert!(!resolved.contains_key("FOOBAR"));
    }

    #[test]
    fn test_declared_but_unset_is_kept_empty() {
        let resolved = test_env().from_wildcards(&["DOES_NOT_EXIST"]).unwrap();
        assert_eq!(resolved.get("DOES_NOT_EXIST").map(String::as_str), Some(""));
        // ...but an unset wildcard matches nothing and adds nothing.
        let resolved = test_env().from_wildcards(&["DOES_NOT_EXIST_*"]).unwrap();
        assert!(resolved.is_empty());
    }

    #[test]
    fn test_to_secret_hashable_hides_values() {
        let resolved = test_env().from_wildcards(&["NODE_ENV"]).unwrap();
        let pairs = resolved.to_secret_hashable();
        assert_eq!(pairs.len(), 1);
        assert!(pairs[0].starts_with("NODE_ENV="));
        assert!(!pairs[0].contains("production"));
    }

    #[test]
    fn test_union_and_difference() {
        let mut base = test_env();
        let extra: EnvironmentVariableMap = [("EXTRA".to_string(), "1".to_string())]
            .into_iter()
            .collect();
        base.union(&extra);
        assert!(base.contains_key("EXTRA"));
        base.difference(&extra);
        assert!(!base.contains_key("EXTRA"));
    }
}
