//! Ignore-rule compilation and matching compatible with `.gitignore` files.
//!
//! A rule file compiles into an [`IgnoreRuleSet`] scoped to the directory that
//! holds it. Paths handed to the matcher are relative to the discovery root;
//! every rule set only applies to paths beneath its own base directory.

use std::path::{Component, Path, PathBuf};

use super::glob::SegmentGlob;

/// One element of a separator-bearing pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternSegment {
    /// `**`: zero or more whole path segments.
    AnyPath,
    Glob(SegmentGlob),
}

/// A single parsed line of a rule file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoreRule {
    base: PathBuf,
    pattern: String,
    negated: bool,
    directory_only: bool,
    anchored: bool,
    has_separator: bool,
    segments: Vec<PatternSegment>,
}

impl IgnoreRule {
    /// Parse one line of a rule file; returns `None` for blanks and comments.
    pub fn parse(base: &Path, line: &str) -> Option<Self> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let line = trim_trailing_spaces(line);
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let (negated, body) = match line.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, line),
        };

        // An escaped trailing slash names the entry itself, file or directory.
        let (directory_only, body) = match body.strip_suffix('/') {
            Some(rest) => match rest.strip_suffix('\\') {
                Some(escaped) => (false, escaped),
                None => (true, rest),
            },
            None => (false, body),
        };

        let (anchored, body) = match body.strip_prefix('/') {
            Some(rest) => (true, rest),
            None => (false, body),
        };

        if body.is_empty() {
            return None;
        }

        let has_separator = body.contains('/');
        let mut segments = Vec::new();
        for part in body.split('/').filter(|part| !part.is_empty()) {
            if part == "**" {
                if segments.last() != Some(&PatternSegment::AnyPath) {
                    segments.push(PatternSegment::AnyPath);
                }
            } else {
                segments.push(PatternSegment::Glob(SegmentGlob::parse(part)));
            }
        }

        if segments.is_empty() {
            return None;
        }

        Some(Self {
            base: base.to_path_buf(),
            pattern: body.to_string(),
            negated,
            directory_only,
            anchored,
            has_separator,
            segments,
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_negation(&self) -> bool {
        self.negated
    }

    pub fn is_directory_only(&self) -> bool {
        self.directory_only
    }

    pub fn is_anchored(&self) -> bool {
        self.anchored
    }

    pub fn has_separator(&self) -> bool {
        self.has_separator
    }

    /// Whether the pattern matches `path` (relative to the discovery root),
    /// ignoring the negation flag.
    pub fn matches(&self, path: &Path, is_dir: bool) -> bool {
        if self.directory_only && !is_dir {
            return false;
        }

        let Some(relative) = relative_segments(path, &self.base) else {
            return false;
        };
        if relative.is_empty() {
            return false;
        }

        if !self.anchored && !self.has_separator {
            return match &self.segments[0] {
                PatternSegment::AnyPath => true,
                PatternSegment::Glob(glob) => relative
                    .last()
                    .is_some_and(|name| glob.is_match(name)),
            };
        }

        match_segments(&self.segments, &relative, Exhaustion::Full)
    }

    /// Whether some path strictly inside `dir` could be matched by this rule.
    ///
    /// Only rules that spell out a path (anchored or containing a separator)
    /// can reach into a directory; basename rules never do.
    pub fn reaches_into(&self, dir: &Path) -> bool {
        if !self.anchored && !self.has_separator {
            return false;
        }
        let Some(relative) = relative_segments(dir, &self.base) else {
            return false;
        };
        match_segments(&self.segments, &relative, Exhaustion::Prefix)
    }
}

/// Ordered rules compiled from one rule file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreRuleSet {
    base: PathBuf,
    rules: Vec<IgnoreRule>,
}

impl IgnoreRuleSet {
    /// Compile rule-file contents scoped to `base` (relative to the discovery root).
    pub fn compile(base: impl Into<PathBuf>, contents: &str) -> Self {
        let base = base.into();
        let rules = contents
            .lines()
            .filter_map(|line| IgnoreRule::parse(&base, line))
            .collect();
        Self { base, rules }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn rules(&self) -> &[IgnoreRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Decide whether `path` is ignored by the scoped rule sets (root first).
pub fn matches(path: &Path, is_dir: bool, scoped: &[IgnoreRuleSet]) -> bool {
    evaluate(path, is_dir, scoped, false)
}

/// Like [`matches`] but starting from an inherited decision; the last
/// matching rule across all sets wins.
pub fn evaluate(path: &Path, is_dir: bool, scoped: &[IgnoreRuleSet], inherited: bool) -> bool {
    scoped
        .iter()
        .flat_map(|set| set.rules.iter())
        .filter(|rule| rule.matches(path, is_dir))
        .last()
        .map_or(inherited, |rule| !rule.negated)
}

/// Whether an ignored directory still holds paths an explicit negation names.
pub fn may_reinclude_within(dir: &Path, scoped: &[IgnoreRuleSet]) -> bool {
    scoped
        .iter()
        .flat_map(|set| set.rules.iter())
        .any(|rule| rule.negated && rule.reaches_into(dir))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Exhaustion {
    /// Pattern and path must run out together.
    Full,
    /// The path runs out while pattern segments remain.
    Prefix,
}

/// Dynamic-programming match of pattern segments against path segments.
///
/// `table[p][s]` records whether `pattern[p..]` accepts `path[s..]`; the
/// table lives only for this call.
fn match_segments(pattern: &[PatternSegment], path: &[String], mode: Exhaustion) -> bool {
    let width = path.len() + 1;
    let mut table = vec![false; (pattern.len() + 1) * width];
    let at = |p: usize, s: usize| p * width + s;

    table[at(pattern.len(), path.len())] = mode == Exhaustion::Full;

    for p in (0..pattern.len()).rev() {
        for s in (0..=path.len()).rev() {
            let accepted = if s == path.len() && mode == Exhaustion::Prefix {
                true
            } else {
                match &pattern[p] {
                    PatternSegment::AnyPath => {
                        table[at(p + 1, s)] || (s < path.len() && table[at(p, s + 1)])
                    }
                    PatternSegment::Glob(glob) => {
                        s < path.len() && glob.is_match(&path[s]) && table[at(p + 1, s + 1)]
                    }
                }
            };
            table[at(p, s)] = accepted;
        }
    }

    table[at(0, 0)]
}

fn relative_segments(path: &Path, base: &Path) -> Option<Vec<String>> {
    let relative = path.strip_prefix(base).ok()?;
    Some(
        relative
            .components()
            .filter_map(|component| match component {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect(),
    )
}

fn trim_trailing_spaces(line: &str) -> &str {
    let mut end = line.len();
    while line[..end].ends_with(' ') {
        if line[..end - 1].ends_with('\\') {
            break;
        }
        end -= 1;
    }
    &line[..end]
}
