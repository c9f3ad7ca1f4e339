//! Broker topic patterns with `+` and `#` wildcards.
//!
//! A pattern is parsed once into segments and then matched level by level
//! against concrete topics. `+` matches exactly one non-empty level; `#`
//! matches zero or more trailing levels, so `a/#` also matches `a`.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic pattern is empty")]
    Empty,
    #[error("'#' must be the last level in topic pattern '{0}'")]
    MultiLevelNotLast(String),
    #[error("wildcard must occupy a whole level in topic pattern '{0}'")]
    PartialWildcard(String),
}

pub type Result<T> = std::result::Result<T, TopicError>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    SingleLevel,
    MultiLevel,
}

/// A validated subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(TopicError::Empty);
        }

        let levels: Vec<&str> = pattern.split('/').collect();
        let last = levels.len() - 1;
        let mut segments = Vec::with_capacity(levels.len());
        for (i, level) in levels.into_iter().enumerate() {
            let segment = match level {
                "#" if i == last => Segment::MultiLevel,
                "#" => return Err(TopicError::MultiLevelNotLast(pattern.to_string())),
                "+" => Segment::SingleLevel,
                literal if literal.contains(['+', '#']) => {
                    return Err(TopicError::PartialWildcard(pattern.to_string()));
                }
                literal => Segment::Literal(literal.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    /// Anchored match of a concrete topic against this pattern.
    pub fn matches(&self, topic: &str) -> bool {
        let mut levels = topic.split('/');
        for segment in &self.segments {
            match segment {
                Segment::MultiLevel => return true,
                Segment::SingleLevel => match levels.next() {
                    Some(level) if !level.is_empty() => {}
                    _ => return false,
                },
                Segment::Literal(expected) => match levels.next() {
                    Some(level) if level == expected => {}
                    _ => return false,
                },
            }
        }
        levels.next().is_none()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn has_wildcards(&self) -> bool {
        self.segments
            .iter()
            .any(|s| !matches!(s, Segment::Literal(_)))
    }
}

impl std::fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for TopicPattern {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Ordered pattern table; the first matching pattern wins.
#[derive(Debug, Clone)]
pub struct TopicRouter<R> {
    routes: Vec<(TopicPattern, R)>,
}

impl<R> Default for TopicRouter<R> {
    fn default() -> Self {
        Self { routes: Vec::new() }
    }
}

impl<R> TopicRouter<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, pattern: &str, route: R) -> Result<()> {
        self.routes.push((TopicPattern::parse(pattern)?, route));
        Ok(())
    }

    pub fn route(&self, topic: &str) -> Option<&R> {
        self.routes
            .iter()
            .find(|(pattern, _)| pattern.matches(topic))
            .map(|(_, route)| route)
    }

    pub fn patterns(&self) -> impl Iterator<Item = &TopicPattern> {
        self.routes.iter().map(|(pattern, _)| pattern)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
