mod suites;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A 16-bit TLS cipher suite identifier as it appears on the wire.
///
/// Serialized as its four-digit hexadecimal form, so it can key TOML tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CipherSuite(pub u16);

impl CipherSuite {
    pub const fn id(self) -> u16 {
        self.0
    }

    /// Returns the IANA name of the suite, if it is a known one.
    pub fn name(self) -> Option<&'static str> {
        suites::lookup(self.0)
    }

    pub const fn to_be_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }
}

impl From<u16> for CipherSuite {
    fn from(id: u16) -> Self {
        Self(id)
    }
}

impl From<CipherSuite> for u16 {
    fn from(suite: CipherSuite) -> Self {
        suite.0
    }
}

/// Known suites render as their IANA name, anything else as four hex digits.
impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "{:04x}", self.0),
        }
    }
}

/// Parses a hexadecimal identifier, with or without a `0x` prefix.
impl FromStr for CipherSuite {
    type Err = PreferenceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if digits.is_empty() || digits.starts_with(['+', '-']) {
            return Err(PreferenceParseError::Suite(s.to_string()));
        }
        u16::from_str_radix(digits, 16)
            .map(CipherSuite)
            .map_err(|_| PreferenceParseError::Suite(s.to_string()))
    }
}

impl Serialize for CipherSuite {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&format_args!("{:04x}", self.0))
    }
}

impl<'de> Deserialize<'de> for CipherSuite {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Display adapter for a cipher suite sequence: `[TLS_AES_128_GCM_SHA256, 0a0a]`.
pub struct SuiteList<'a>(pub &'a [CipherSuite]);

impl fmt::Display for SuiteList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, suite) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", suite)?;
        }
        f.write_str("]")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreferenceParseError {
    #[error("empty preference entry")]
    Empty,
    #[error("invalid cipher suite id {0:?}: expected a 16-bit hexadecimal value")]
    Suite(String),
    #[error("invalid preference score {0:?}: expected an integer")]
    Score(String),
}

/// One `SUITE[=SCORE]` entry, as given on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreferenceEntry {
    pub suite: CipherSuite,
    pub score: i64,
}

impl PreferenceEntry {
    /// Score assigned when an entry names a suite without `=SCORE`.
    pub const IMPLICIT_SCORE: i64 = 1;
}

impl FromStr for PreferenceEntry {
    type Err = PreferenceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(PreferenceParseError::Empty);
        }
        let (suite, score) = match s.split_once('=') {
            Some((suite, score)) => {
                let score = score
                    .trim()
                    .parse()
                    .map_err(|_| PreferenceParseError::Score(score.to_string()))?;
                (suite, score)
            }
            None => (s, Self::IMPLICIT_SCORE),
        };
        Ok(Self {
            suite: suite.parse()?,
            score,
        })
    }
}

/// Cipher suite priorities for one connection. Higher scores sort first.
///
/// Built once before dialing and shared read-only afterwards. Suites that
/// are not listed score [`Preferences::DEFAULT_SCORE`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preferences {
    scores: HashMap<CipherSuite, i64>,
}

impl Preferences {
    pub const DEFAULT_SCORE: i64 = 0;

    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the score of `suite`, returning the previous one.
    pub fn insert(&mut self, suite: CipherSuite, score: i64) -> Option<i64> {
        self.scores.insert(suite, score)
    }

    pub fn get(&self, suite: CipherSuite) -> Option<i64> {
        self.scores.get(&suite).copied()
    }

    pub fn score(&self, suite: CipherSuite) -> i64 {
        self.get(suite).unwrap_or(Self::DEFAULT_SCORE)
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Entries ordered by descending score, then by identifier.
    pub fn ranked(&self) -> Vec<PreferenceEntry> {
        let mut entries: Vec<PreferenceEntry> = self
            .scores
            .iter()
            .map(|(&suite, &score)| PreferenceEntry { suite, score })
            .collect();
        entries.sort_by(|a, b| b.score.cmp(&a.score).then(a.suite.cmp(&b.suite)));
        entries
    }
}

impl Extend<PreferenceEntry> for Preferences {
    fn extend<I: IntoIterator<Item = PreferenceEntry>>(&mut self, iter: I) {
        for entry in iter {
            self.insert(entry.suite, entry.score);
        }
    }
}

impl FromIterator<PreferenceEntry> for Preferences {
    fn from_iter<I: IntoIterator<Item = PreferenceEntry>>(iter: I) -> Self {
        let mut preferences = Self::new();
        preferences.extend(iter);
        preferences
    }
}

impl FromIterator<(CipherSuite, i64)> for Preferences {
    fn from_iter<I: IntoIterator<Item = (CipherSuite, i64)>>(iter: I) -> Self {
        iter.into_iter()
            .map(|(suite, score)| PreferenceEntry { suite, score })
            .collect()
    }
}
