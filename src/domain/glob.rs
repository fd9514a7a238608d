//! Shell-style glob matching for a single path segment.
//!
//! Supports `*`, `?` and bracket classes (`[abc]`, `[a-z]`, `[!x]`, `[^x]`).
//! Backslash escapes are resolved while parsing, so an escaped wildcard is
//! stored as a literal and never matches more than itself. Wildcards do not
//! cross `/`: callers split paths into segments before matching.

/// One parsed element of a segment pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobToken {
    Literal(char),
    AnyChar,
    AnyRun,
    Class { negated: bool, items: Vec<ClassItem> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassItem {
    Single(char),
    Range(char, char),
}

impl ClassItem {
    fn contains(&self, candidate: char) -> bool {
        match *self {
            ClassItem::Single(c) => c == candidate,
            ClassItem::Range(low, high) => low <= candidate && candidate <= high,
        }
    }
}

impl GlobToken {
    fn matches_char(&self, candidate: char) -> bool {
        match self {
            GlobToken::Literal(c) => *c == candidate,
            GlobToken::AnyChar => true,
            GlobToken::AnyRun => false,
            GlobToken::Class { negated, items } => {
                items.iter().any(|item| item.contains(candidate)) != *negated
            }
        }
    }
}

/// A compiled glob for one path segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentGlob {
    tokens: Vec<GlobToken>,
}

impl SegmentGlob {
    /// Compile a raw (still escaped) segment pattern.
    pub fn parse(source: &str) -> Self {
        let chars: Vec<char> = source.chars().collect();
        let mut tokens = Vec::with_capacity(chars.len());
        let mut index = 0;

        while index < chars.len() {
            match chars[index] {
                '\\' => match chars.get(index + 1) {
                    Some(&escaped) => {
                        tokens.push(GlobToken::Literal(escaped));
                        index += 2;
                    }
                    None => {
                        tokens.push(GlobToken::Literal('\\'));
                        index += 1;
                    }
                },
                '*' => {
                    if tokens.last() != Some(&GlobToken::AnyRun) {
                        tokens.push(GlobToken::AnyRun);
                    }
                    index += 1;
                }
                '?' => {
                    tokens.push(GlobToken::AnyChar);
                    index += 1;
                }
                '[' => match parse_class(&chars, index + 1) {
                    Some((token, next)) => {
                        tokens.push(token);
                        index = next;
                    }
                    None => {
                        tokens.push(GlobToken::Literal('['));
                        index += 1;
                    }
                },
                other => {
                    tokens.push(GlobToken::Literal(other));
                    index += 1;
                }
            }
        }

        Self { tokens }
    }

    pub fn tokens(&self) -> &[GlobToken] {
        &self.tokens
    }

    /// Returns true when the glob accepts every possible segment.
    pub fn matches_any(&self) -> bool {
        self.tokens == [GlobToken::AnyRun]
    }

    pub fn is_match(&self, name: &str) -> bool {
        let text: Vec<char> = name.chars().collect();
        let tokens = &self.tokens;
        let mut token_index = 0;
        let mut text_index = 0;
        // Position of the most recent `*` and the text offset it currently absorbs up to.
        let mut resume: Option<(usize, usize)> = None;

        while text_index < text.len() {
            match tokens.get(token_index) {
                Some(GlobToken::AnyRun) => {
                    resume = Some((token_index, text_index));
                    token_index += 1;
                    continue;
                }
                Some(token) if token.matches_char(text[text_index]) => {
                    token_index += 1;
                    text_index += 1;
                    continue;
                }
                _ => {}
            }

            match resume {
                Some((star, absorbed)) => {
                    token_index = star + 1;
                    text_index = absorbed + 1;
                    resume = Some((star, absorbed + 1));
                }
                None => return false,
            }
        }

        tokens[token_index..]
            .iter()
            .all(|token| *token == GlobToken::AnyRun)
    }
}

fn parse_class(chars: &[char], start: usize) -> Option<(GlobToken, usize)> {
    let mut index = start;
    let negated = matches!(chars.get(index), Some('!') | Some('^'));
    if negated {
        index += 1;
    }

    let mut items = Vec::new();
    let mut first = true;

    loop {
        let current = *chars.get(index)?;
        if current == ']' && !first {
            return Some((GlobToken::Class { negated, items }, index + 1));
        }
        first = false;

        let (low, after_low) = read_class_char(chars, index)?;
        let is_range = chars.get(after_low) == Some(&'-')
            && chars.get(after_low + 1).is_some_and(|next| *next != ']');

        if is_range {
            let (high, after_high) = read_class_char(chars, after_low + 1)?;
            items.push(ClassItem::Range(low, high));
            index = after_high;
        } else {
            items.push(ClassItem::Single(low));
            index = after_low;
        }
    }
}

fn read_class_char(chars: &[char], index: usize) -> Option<(char, usize)> {
    match *chars.get(index)? {
        '\\' => chars.get(index + 1).map(|escaped| (*escaped, index + 2)),
        other => Some((other, index + 1)),
    }
}
