//! Path templates and matching
//!
//! Templates follow the Google API HTTP annotation syntax:
//! `/v1/{metadata.name}/items/*`, `/files/{path=**}`, `/idp:watch`.

use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// Invalid path template
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("template must start with '/'")]
    MissingLeadingSlash,

    #[error("unbalanced or nested braces")]
    UnbalancedBraces,

    #[error("empty path segment")]
    EmptySegment,

    #[error("empty capture name")]
    EmptyCaptureName,

    #[error("invalid capture name {0:?}")]
    InvalidCaptureName(String),

    #[error("duplicate capture {0:?}")]
    DuplicateCapture(String),

    #[error("'**' is only allowed in the last segment")]
    GreedyNotLast,

    #[error("unsupported sub-pattern {0:?}: captures may only match '*' or '**'")]
    UnsupportedSubPattern(String),

    #[error("invalid segment {0:?}")]
    InvalidSegment(String),

    #[error("empty verb")]
    EmptyVerb,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard,
    Capture(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Greedy {
    Anonymous,
    Capture(String),
}

/// Literal/wildcard outline of a pattern
///
/// Two patterns with the same shape match exactly the same paths, whatever
/// their capture names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    segments: Vec<Option<String>>,
    greedy: bool,
    verb: Option<String>,
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            write!(f, "/{}", segment.as_deref().unwrap_or("*"))?;
        }
        if self.greedy {
            f.write_str("/**")?;
        }
        if self.segments.is_empty() && !self.greedy {
            f.write_str("/")?;
        }
        if let Some(verb) = &self.verb {
            write!(f, ":{}", verb)?;
        }
        Ok(())
    }
}

/// Named values captured from a request path, in template order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captures {
    values: Vec<(String, String)>,
}

impl Captures {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Compiled path template
#[derive(Debug, Clone)]
pub struct PathPattern {
    template: String,
    segments: Vec<Segment>,
    greedy: Option<Greedy>,
    verb: Option<String>,
}

impl PathPattern {
    /// Compile a template
    pub fn compile(template: &str) -> Result<Self, PatternError> {
        let body = template
            .strip_prefix('/')
            .ok_or(PatternError::MissingLeadingSlash)?;

        let mut raw = split_segments(body)?;
        let verb = match raw.last_mut() {
            Some(last) => take_verb(last)?,
            None => None,
        };
        if raw.len() == 1 && raw[0].is_empty() {
            raw.clear();
        }

        let mut segments = Vec::with_capacity(raw.len());
        let mut greedy = None;
        let mut names = HashSet::new();
        let count = raw.len();

        for (i, part) in raw.into_iter().enumerate() {
            let last = i + 1 == count;
            match part {
                "" => return Err(PatternError::EmptySegment),
                "*" => segments.push(Segment::Wildcard),
                "**" => {
                    if !last {
                        return Err(PatternError::GreedyNotLast);
                    }
                    greedy = Some(Greedy::Anonymous);
                }
                _ if part.starts_with('{') && part.ends_with('}') => {
                    let inner = &part[1..part.len() - 1];
                    let (name, sub) = match inner.split_once('=') {
                        Some((name, sub)) => (name.trim(), Some(sub.trim())),
                        None => (inner.trim(), None),
                    };
                    validate_capture_name(name)?;
                    if !names.insert(name.to_string()) {
                        return Err(PatternError::DuplicateCapture(name.to_string()));
                    }
                    match sub {
                        None | Some("*") => segments.push(Segment::Capture(name.to_string())),
                        Some("**") => {
                            if !last {
                                return Err(PatternError::GreedyNotLast);
                            }
                            greedy = Some(Greedy::Capture(name.to_string()));
                        }
                        Some(other) => {
                            return Err(PatternError::UnsupportedSubPattern(other.to_string()))
                        }
                    }
                }
                _ if part.contains(['{', '}', '*', '=']) => {
                    return Err(PatternError::InvalidSegment(part.to_string()))
                }
                _ => segments.push(Segment::Literal(part.to_string())),
            }
        }

        Ok(Self {
            template: template.to_string(),
            segments,
            greedy,
            verb,
        })
    }

    /// Source template
    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn verb(&self) -> Option<&str> {
        self.verb.as_deref()
    }

    /// Declared capture names, in template order
    pub fn capture_names(&self) -> impl Iterator<Item = &str> {
        let greedy = match &self.greedy {
            Some(Greedy::Capture(name)) => Some(name.as_str()),
            _ => None,
        };
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Capture(name) => Some(name.as_str()),
                _ => None,
            })
            .chain(greedy)
    }

    pub fn shape(&self) -> Shape {
        Shape {
            segments: self
                .segments
                .iter()
                .map(|s| match s {
                    Segment::Literal(l) => Some(l.clone()),
                    Segment::Wildcard | Segment::Capture(_) => None,
                })
                .collect(),
            greedy: self.greedy.is_some(),
            verb: self.verb.clone(),
        }
    }

    /// Match a request path (without query string)
    pub fn matches(&self, path: &str) -> Option<Captures> {
        let mut rest = path.strip_prefix('/')?;
        if let Some(verb) = &self.verb {
            rest = rest.strip_suffix(verb.as_str())?.strip_suffix(':')?;
        }
        let components: Vec<&str> = if rest.is_empty() {
            Vec::new()
        } else {
            rest.split('/').collect()
        };

        let fixed = self.segments.len();
        if components.len() < fixed || (self.greedy.is_none() && components.len() != fixed) {
            return None;
        }

        let mut values = Vec::new();
        for (segment, component) in self.segments.iter().zip(&components) {
            match segment {
                Segment::Literal(literal) => {
                    if literal != component {
                        return None;
                    }
                }
                Segment::Wildcard => {
                    if component.is_empty() {
                        return None;
                    }
                }
                Segment::Capture(name) => {
                    if component.is_empty() {
                        return None;
                    }
                    values.push((name.clone(), percent_decode(component)?));
                }
            }
        }

        if let Some(Greedy::Capture(name)) = &self.greedy {
            let tail = components[fixed..]
                .iter()
                .map(|c| percent_decode(c))
                .collect::<Option<Vec<_>>>()?;
            values.push((name.clone(), tail.join("/")));
        }

        Some(Captures { values })
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.template)
    }
}

/// Split on '/' outside braces
fn split_segments(body: &str) -> Result<Vec<&str>, PatternError> {
    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in body.char_indices() {
        match c {
            '{' => {
                depth += 1;
                if depth > 1 {
                    return Err(PatternError::UnbalancedBraces);
                }
            }
            '}' => {
                depth = depth.checked_sub(1).ok_or(PatternError::UnbalancedBraces)?;
            }
            '/' if depth == 0 => {
                segments.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(PatternError::UnbalancedBraces);
    }
    segments.push(&body[start..]);
    Ok(segments)
}

/// Cut a `:verb` suffix off the last segment
fn take_verb(last: &mut &str) -> Result<Option<String>, PatternError> {
    let mut depth = 0usize;
    let mut colon = None;
    for (i, c) in last.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            ':' if depth == 0 => colon = Some(i),
            _ => {}
        }
    }
    let Some(i) = colon else {
        return Ok(None);
    };
    let verb = &last[i + 1..];
    if verb.is_empty() {
        return Err(PatternError::EmptyVerb);
    }
    if verb.contains(['{', '}', '*', '/']) {
        return Err(PatternError::InvalidSegment(last.to_string()));
    }
    let verb = verb.to_string();
    *last = &last[..i];
    Ok(Some(verb))
}

fn validate_capture_name(name: &str) -> Result<(), PatternError> {
    if name.is_empty() {
        return Err(PatternError::EmptyCaptureName);
    }
    let valid = name.split('.').all(|part| {
        !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    });
    if !valid {
        return Err(PatternError::InvalidCaptureName(name.to_string()));
    }
    Ok(())
}

/// Decode `%XX` escapes; malformed escapes are kept as-is
///
/// Returns `None` when the decoded bytes are not UTF-8.
fn percent_decode(component: &str) -> Option<String> {
    urlencoding::decode(component).ok().map(Cow::into_owned)
}
