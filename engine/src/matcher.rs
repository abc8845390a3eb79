//! Include/exclude pattern matching.
//!
//! Patterns are shell-style globs (`*`, `?`, `[...]`). `*` may span
//! directory separators, so `*.txt` matches at any depth. A pattern is
//! tested against three forms of the relative path:
//! - the file name (`b.tmp`)
//! - the relative path (`temp/b.tmp`)
//! - the rooted relative path (`/temp/b.tmp`), so `*/temp/*` also catches
//!   a `temp` directory sitting directly under the source root
//!
//! Case sensitivity is an explicit flag, never inferred from the platform.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::model::normalize_relative;

/// An ordered list of glob patterns, written as `a;b;c`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct PatternList(Vec<String>);

impl PatternList {
    /// Parse a semicolon-separated list. Blank entries are dropped.
    pub fn parse(raw: &str) -> Self {
        PatternList(
            raw.split(';')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn patterns(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for PatternList {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PatternList::parse(s))
    }
}

impl From<String> for PatternList {
    fn from(raw: String) -> Self {
        PatternList::parse(&raw)
    }
}

impl From<PatternList> for String {
    fn from(list: PatternList) -> Self {
        list.0.join(";")
    }
}

impl<S: Into<String>> FromIterator<S> for PatternList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        PatternList(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for PatternList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(";"))
    }
}

/// Compiled include/exclude filter. Pure: depends only on its inputs.
#[derive(Debug, Clone)]
pub struct Matcher {
    include: GlobSet,
    exclude: GlobSet,
}

impl Matcher {
    /// Compile pattern lists. An invalid glob is a validation error.
    pub fn new(
        include: &PatternList,
        exclude: &PatternList,
        case_sensitive: bool,
    ) -> Result<Self, ValidationError> {
        Ok(Matcher {
            include: compile(include, case_sensitive)?,
            exclude: compile(exclude, case_sensitive)?,
        })
    }

    /// Matcher that accepts everything.
    pub fn match_all() -> Self {
        Matcher {
            include: GlobSet::empty(),
            exclude: GlobSet::empty(),
        }
    }

    /// True if the path passes include (empty = all) and hits no exclude.
    pub fn matches(&self, relative_path: &Path) -> bool {
        self.matches_str(&normalize_relative(relative_path))
    }

    pub fn matches_str(&self, relative: &str) -> bool {
        let relative = relative.trim_start_matches('/');
        let name = relative.rsplit('/').next().unwrap_or(relative);
        let rooted = format!("/{}", relative);
        let forms = [name, relative, rooted.as_str()];

        let included =
            self.include.is_empty() || forms.iter().any(|f| self.include.is_match(f));
        included && !forms.iter().any(|f| self.exclude.is_match(f))
    }
}

fn compile(patterns: &PatternList, case_sensitive: bool) -> Result<GlobSet, ValidationError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns.patterns() {
        let glob = GlobBuilder::new(pattern)
            .case_insensitive(!case_sensitive)
            .literal_separator(false)
            .backslash_escape(true)
            .build()
            .map_err(|e| ValidationError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.kind().to_string(),
            })?;
        builder.add(glob);
    }
    builder.build().map_err(|e| ValidationError::InvalidPattern {
        pattern: patterns.to_string(),
        reason: e.to_string(),
    })
}

/// One-shot form of [`Matcher::matches`].
pub fn matches(
    relative_path: &Path,
    include: &PatternList,
    exclude: &PatternList,
    case_sensitive: bool,
) -> Result<bool, ValidationError> {
    Ok(Matcher::new(include, exclude, case_sensitive)?.matches(relative_path))
}
