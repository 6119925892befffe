//! Broker subject syntax.
//!
//! Subjects are `.` separated labels, `<prefix>.<channel>[.<label>]*`.
//! Subscription patterns may use `*` for exactly one label and a trailing `>`
//! for one or more remaining labels. Matching is case-sensitive.

use std::fmt::{self, Write};
use std::{ops, str::FromStr};

use bytestring::ByteString;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};

use crate::types::{ChannelId, Subject, Subtopic};
use crate::{FabricError, Result};

const SEPARATOR: char = '.';
const SINGLE_WILDCARD: &str = "*";
const MULTI_WILDCARD: &str = ">";

const NOT_ALLOWED_CHARS: [char; 3] = [' ', '#', '+'];
const NOT_ALLOWED_WILDCARDS: [char; 2] = ['*', '>'];

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("InvalidTopic({0})")]
    InvalidTopic(String),
    #[error("InvalidLevel({0})")]
    InvalidLevel(String),
}

impl From<TopicError> for FabricError {
    fn from(e: TopicError) -> Self {
        FabricError::InvalidSubtopic(e.to_string())
    }
}

#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
pub enum Level {
    Normal(String),
    SingleWildcard, // *
    MultiWildcard,  // >
}

impl Level {
    pub fn parse<T: AsRef<str>>(s: T) -> Result<Level, TopicError> {
        Level::from_str(s.as_ref())
    }

    pub fn normal<T: AsRef<str>>(s: T) -> Result<Level, TopicError> {
        match Level::from_str(s.as_ref())? {
            Level::Normal(s) => Ok(Level::Normal(s)),
            _ => Err(TopicError::InvalidLevel(format!("invalid normal level `{}` is a wildcard", s.as_ref()))),
        }
    }

    #[inline]
    pub fn value(&self) -> Option<&str> {
        match *self {
            Level::Normal(ref s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn is_normal(&self) -> bool {
        matches!(*self, Level::Normal(_))
    }

    #[inline]
    pub fn is_wildcard(&self) -> bool {
        !self.is_normal()
    }
}

macro_rules! match_levels {
    ($topic:expr, $levels:expr) => {{
        let mut lhs = $topic.0.iter();

        for rhs in $levels {
            match lhs.next() {
                Some(&Level::SingleWildcard) => {
                    if !rhs.match_level(&Level::SingleWildcard) {
                        return false;
                    }
                }
                //at least the current label is consumed
                Some(&Level::MultiWildcard) => {
                    return rhs.match_level(&Level::MultiWildcard);
                }
                Some(level) if rhs.match_level(level) => continue,
                _ => return false,
            }
        }

        //a trailing `>` left over has nothing to consume
        lhs.next().is_none()
    }};
}

/// Label sequence of a subject or subscription pattern.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize, Default)]
pub struct Topic(Vec<Level>);

impl Topic {
    #[inline]
    pub fn levels(&self) -> &Vec<Level> {
        &self.0
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.0
            .iter()
            .enumerate()
            .position(|(pos, level)| matches!(*level, Level::MultiWildcard if pos != self.0.len() - 1))
            .is_none()
    }

    #[inline]
    pub fn has_wildcards(&self) -> bool {
        self.0.iter().any(Level::is_wildcard)
    }

    pub fn matches(&self, topic: &Topic) -> bool {
        match_levels!(self, &topic.0)
    }

    pub fn matches_str<S: AsRef<str> + ?Sized>(&self, topic: &S) -> bool {
        match_levels!(self, topic.as_ref().split(SEPARATOR))
    }
}

impl From<Vec<Level>> for Topic {
    fn from(v: Vec<Level>) -> Self {
        Topic(v)
    }
}

impl From<Topic> for Vec<Level> {
    fn from(t: Topic) -> Self {
        t.0
    }
}

impl ops::Deref for Topic {
    type Target = Vec<Level>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

pub(crate) trait MatchLevel {
    fn match_level(&self, level: &Level) -> bool;
}

impl MatchLevel for Level {
    fn match_level(&self, level: &Level) -> bool {
        match *level {
            Level::Normal(ref lhs) => {
                if let Level::Normal(ref rhs) = *self {
                    lhs == rhs
                } else {
                    false
                }
            }
            Level::SingleWildcard | Level::MultiWildcard => self.is_normal(),
        }
    }
}

impl<T: AsRef<str>> MatchLevel for T {
    fn match_level(&self, level: &Level) -> bool {
        match *level {
            Level::Normal(ref lhs) => lhs == self.as_ref(),
            Level::SingleWildcard | Level::MultiWildcard => !self.as_ref().is_empty(),
        }
    }
}

impl FromStr for Level {
    type Err = TopicError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, TopicError> {
        match s {
            SINGLE_WILDCARD => Ok(Level::SingleWildcard),
            MULTI_WILDCARD => Ok(Level::MultiWildcard),
            "" => Err(TopicError::InvalidLevel("empty label".into())),
            _ => {
                if s.contains(NOT_ALLOWED_WILDCARDS) {
                    Err(TopicError::InvalidLevel(format!("invalid level `{s}` contains *|>")))
                } else if s.contains(char::is_whitespace) {
                    Err(TopicError::InvalidLevel(format!("invalid level `{s}` contains whitespace")))
                } else {
                    Ok(Level::Normal(String::from(s)))
                }
            }
        }
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, TopicError> {
        s.split(SEPARATOR).map(Level::from_str).collect::<Result<Vec<_>, TopicError>>().map(Topic).and_then(
            |topic| {
                if topic.is_valid() {
                    Ok(topic)
                } else {
                    Err(TopicError::InvalidTopic(format!("invalid topic `{s}`")))
                }
            },
        )
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Level::Normal(ref s) => f.write_str(s.as_str()),
            Level::SingleWildcard => f.write_str(SINGLE_WILDCARD),
            Level::MultiWildcard => f.write_str(MULTI_WILDCARD),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;

        for level in &self.0 {
            if first {
                first = false;
            } else {
                f.write_char(SEPARATOR)?;
            }

            level.fmt(f)?;
        }

        Ok(())
    }
}

/// Subscription pattern: a literal channel plus an optional subtopic pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern {
    pub channel: ChannelId,
    pub subtopic: Topic,
}

impl Pattern {
    #[inline]
    pub fn new<C: Into<ChannelId>>(channel: C, subtopic: Topic) -> Self {
        Self { channel: channel.into(), subtopic }
    }

    /// Pattern matched against a `(channel, subtopic)` pair, no prefix involved.
    pub fn matches(&self, channel: &str, subtopic: &str) -> bool {
        if self.channel != channel {
            return false;
        }
        if subtopic.is_empty() {
            return self.subtopic.is_empty();
        }
        self.subtopic.matches_str(subtopic)
    }
}

impl FromStr for Pattern {
    type Err = FabricError;

    fn from_str(s: &str) -> Result<Self> {
        let (channel, sub) = match s.split_once(SEPARATOR) {
            Some((channel, sub)) => (channel, Some(sub)),
            None => (s, None),
        };
        validate_channel(channel)?;
        let subtopic = match sub {
            Some(sub) => Topic::from_str(sub)?,
            None => Topic::default(),
        };
        Ok(Pattern { channel: ChannelId::from(channel), subtopic })
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.channel)?;
        if !self.subtopic.is_empty() {
            f.write_char(SEPARATOR)?;
            self.subtopic.fmt(f)?;
        }
        Ok(())
    }
}

/// Channel ids are opaque but must fit in one subject label.
pub fn validate_channel(channel: &str) -> Result<()> {
    if channel.is_empty() {
        return Err(FabricError::MalformedEntity("empty channel".into()));
    }
    if channel.contains(|c: char| c == SEPARATOR || c.is_whitespace() || NOT_ALLOWED_WILDCARDS.contains(&c)) {
        return Err(FabricError::MalformedEntity(format!("invalid channel `{channel}`")));
    }
    Ok(())
}

/// Translates between `(channel, subtopic)` and broker subjects.
#[derive(Debug, Clone)]
pub struct Router {
    prefix: ByteString,
}

impl Default for Router {
    fn default() -> Self {
        Router::new("m")
    }
}

impl Router {
    #[inline]
    pub fn new<P: Into<ByteString>>(prefix: P) -> Self {
        Self { prefix: prefix.into() }
    }

    #[inline]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[inline]
    pub fn subject_of(&self, channel: &str, subtopic: &str) -> Subject {
        if subtopic.is_empty() {
            ByteString::from(format!("{}.{}", self.prefix, channel))
        } else {
            ByteString::from(format!("{}.{}.{}", self.prefix, channel, subtopic))
        }
    }

    #[inline]
    pub fn pattern_subject(&self, pattern: &Pattern) -> Subject {
        ByteString::from(format!("{}.{}", self.prefix, pattern))
    }

    /// Splits a broker subject back into `(channel, subtopic)`.
    pub fn parse_subject(&self, subject: &str) -> Result<(ChannelId, Subtopic)> {
        let rest = subject
            .strip_prefix(&*self.prefix)
            .and_then(|s| s.strip_prefix(SEPARATOR))
            .ok_or_else(|| FabricError::MalformedEntity(format!("subject `{subject}` lacks prefix")))?;
        let (channel, subtopic) = rest.split_once(SEPARATOR).unwrap_or((rest, ""));
        validate_channel(channel)?;
        Ok((ChannelId::from(channel), Subtopic::from(subtopic)))
    }
}

/// Whether a broker subject is delivered to a subscription pattern, both in
/// subject syntax. Invalid patterns match nothing.
#[inline]
pub fn matches(pattern: &str, subject: &str) -> bool {
    match Topic::from_str(pattern) {
        Ok(p) => p.matches_str(subject),
        Err(_) => false,
    }
}

/// Normalizes an adapter supplied publish subtopic (`a/b`, `%2Fa%2Fb`, `a.b`)
/// into the dotted form. Wildcards are rejected.
pub fn parse_publish_subtopic(subtopic: &str) -> Result<Subtopic> {
    if subtopic.is_empty() {
        return Ok(Subtopic::default());
    }
    let subtopic = format_subtopic(subtopic)?;
    if subtopic.contains(NOT_ALLOWED_CHARS) || subtopic.contains(NOT_ALLOWED_WILDCARDS) {
        return Err(FabricError::InvalidSubtopic(format!("`{subtopic}` contains a reserved character")));
    }
    Ok(Subtopic::from(join_labels(&subtopic)))
}

/// Normalizes a subscribe subtopic, translating MQTT `+`/`#` into `*`/`>`.
pub fn parse_subscribe_subtopic(subtopic: &str) -> Result<Subtopic> {
    if subtopic.is_empty() {
        return Ok(Subtopic::default());
    }
    let subtopic = subtopic.replace('+', SINGLE_WILDCARD).replace('#', MULTI_WILDCARD);
    let subtopic = format_subtopic(&subtopic)?;

    let mut labels = Vec::new();
    for label in subtopic.split(SEPARATOR).filter(|l| !l.is_empty()) {
        let invalid = if label.len() == 1 {
            label.contains(NOT_ALLOWED_CHARS)
        } else {
            label.contains(NOT_ALLOWED_CHARS) || label.contains(NOT_ALLOWED_WILDCARDS)
        };
        if invalid {
            return Err(FabricError::InvalidSubtopic(format!("invalid label `{label}`")));
        }
        labels.push(label);
    }
    Ok(Subtopic::from(labels.join(".")))
}

/// Adapter-facing topic, `[/]channels/<channel>/messages[/<subtopic>]`.
/// Returns the channel and the raw, not yet normalized, subtopic.
pub fn parse_channel_topic(topic: &str) -> Result<(ChannelId, String)> {
    let malformed = || FabricError::MalformedEntity(format!("malformed topic `{topic}`"));
    let topic = topic.split_once('?').map(|(t, _)| t).unwrap_or(topic);
    let rest = topic.strip_prefix('/').unwrap_or(topic);
    let rest = rest.strip_prefix("channels/").ok_or_else(malformed)?;
    let (channel, rest) = rest.split_once('/').ok_or_else(malformed)?;
    if channel.is_empty() || !channel.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(malformed());
    }
    let sub = match rest.strip_prefix("messages") {
        Some("") => "",
        Some(sub) if sub.starts_with('/') => sub,
        _ => return Err(malformed()),
    };
    Ok((ChannelId::from(channel), sub.to_owned()))
}

fn format_subtopic(subtopic: &str) -> Result<String> {
    let subtopic = query_unescape(subtopic)?;
    let subtopic = subtopic.strip_prefix('/').unwrap_or(&subtopic);
    let subtopic = subtopic.strip_suffix('/').unwrap_or(subtopic);
    Ok(subtopic.trim().replace('/', "."))
}

fn join_labels(subtopic: &str) -> String {
    subtopic.split(SEPARATOR).filter(|l| !l.is_empty()).collect::<Vec<_>>().join(".")
}

//Query-string unescaping, `+` decodes to a space
fn query_unescape(s: &str) -> Result<String> {
    let bad = || FabricError::InvalidSubtopic(format!("invalid escape in `{s}`"));
    let escapes_ok = s
        .match_indices('%')
        .all(|(i, _)| s.as_bytes().get(i + 1..i + 3).is_some_and(|h| h.iter().all(u8::is_ascii_hexdigit)));
    if !escapes_ok {
        return Err(bad());
    }
    let s = s.replace('+', " ");
    percent_decode_str(&s).decode_utf8().map(|v| v.into_owned()).map_err(|_| bad())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level() {
        assert!(Level::normal("temp").unwrap().is_normal());
        assert_eq!(Level::normal("temp").unwrap().value(), Some("temp"));
        assert_eq!(Level::parse("*").unwrap(), Level::SingleWildcard);
        assert_eq!(Level::parse(">").unwrap(), Level::MultiWildcard);
        assert!(Level::normal("*").is_err());
        assert!(Level::parse("te*mp").is_err());
        assert!(Level::parse("").is_err());
    }

    #[test]
    fn test_parse_topic() {
        let t: Topic = "temp.*.>".parse().unwrap();
        assert_eq!(t.len(), 3);
        assert_eq!(t.to_string(), "temp.*.>");
        assert!(t.has_wildcards());
        assert!("temp.>.room".parse::<Topic>().is_err());
        assert!("temp..room".parse::<Topic>().is_err());
    }

    #[test]
    fn test_matches() {
        assert!(matches("m.ch1.temp.*", "m.ch1.temp.room1"));
        assert!(!matches("m.ch1.temp.*", "m.ch1.temp.room1.a"));
        assert!(!matches("m.ch1.temp.*", "m.ch1.temp"));
        assert!(matches("m.ch1.>", "m.ch1.a"));
        assert!(matches("m.ch1.>", "m.ch1.a.b.c"));
        //`>` needs at least one label
        assert!(!matches("m.ch1.>", "m.ch1"));
        assert!(matches("m.ch1", "m.ch1"));
        assert!(!matches("m.ch1", "m.ch1.a"));
        assert!(matches("m.*.a", "m.ch2.a"));
        //case-sensitive
        assert!(!matches("m.ch1.Temp", "m.ch1.temp"));
        assert!(!matches("m..ch1", "m..ch1"));
    }

    #[test]
    fn test_pattern() {
        let p: Pattern = "ch1.temp.*".parse().unwrap();
        assert_eq!(p.channel, "ch1");
        assert!(p.matches("ch1", "temp.room1"));
        assert!(!p.matches("ch2", "temp.room1"));
        assert!(!p.matches("ch1", ""));

        let p: Pattern = "ch1".parse().unwrap();
        assert!(p.matches("ch1", ""));
        assert!(!p.matches("ch1", "a"));

        let p: Pattern = "ch1.>".parse().unwrap();
        assert!(!p.matches("ch1", ""));
        assert!(p.matches("ch1", "a.b"));
        assert_eq!(p.to_string(), "ch1.>");

        assert!("*.temp".parse::<Pattern>().is_err());
        assert!("".parse::<Pattern>().is_err());
    }

    #[test]
    fn test_router() {
        let r = Router::default();
        assert_eq!(r.subject_of("ch1", "temp.room1"), "m.ch1.temp.room1");
        assert_eq!(r.subject_of("ch1", ""), "m.ch1");
        let p: Pattern = "ch1.temp.*".parse().unwrap();
        assert_eq!(r.pattern_subject(&p), "m.ch1.temp.*");
        assert!(matches(&r.pattern_subject(&p), &r.subject_of("ch1", "temp.room1")));

        let (c, s) = r.parse_subject("m.ch1.temp.room1").unwrap();
        assert_eq!((c.as_ref(), s.as_ref()), ("ch1", "temp.room1"));
        let (c, s) = r.parse_subject("m.ch1").unwrap();
        assert_eq!((c.as_ref(), s.as_ref()), ("ch1", ""));
        assert!(r.parse_subject("x.ch1").is_err());
        assert!(r.parse_subject("mm.ch1").is_err());
    }

    #[test]
    fn test_publish_subtopic() {
        assert_eq!(parse_publish_subtopic("").unwrap(), "");
        assert_eq!(parse_publish_subtopic("/temp/room1/").unwrap(), "temp.room1");
        assert_eq!(parse_publish_subtopic("temp%2Froom1").unwrap(), "temp.room1");
        assert_eq!(parse_publish_subtopic("temp//room1").unwrap(), "temp.room1");
        assert!(parse_publish_subtopic("temp/*").is_err());
        assert!(parse_publish_subtopic("temp/#").is_err());
        assert!(parse_publish_subtopic("te mp").is_err());
        assert!(parse_publish_subtopic("temp%zz").is_err());
        assert!(parse_publish_subtopic("temp%2").is_err());
        assert!(parse_publish_subtopic("temp%ff").is_err());
        assert_eq!(parse_publish_subtopic("a%2Eb/c").unwrap(), "a.b.c");
    }

    #[test]
    fn test_subscribe_subtopic() {
        assert_eq!(parse_subscribe_subtopic("temp/+/value").unwrap(), "temp.*.value");
        assert_eq!(parse_subscribe_subtopic("temp/#").unwrap(), "temp.>");
        assert_eq!(parse_subscribe_subtopic("/temp//>").unwrap(), "temp.>");
        assert!(parse_subscribe_subtopic("temp/a*").is_err());
        assert!(parse_subscribe_subtopic("temp/a>b").is_err());
    }

    #[test]
    fn test_channel_topic() {
        let (c, s) = parse_channel_topic("/channels/ch1/messages/temp/room1").unwrap();
        assert_eq!(c, "ch1");
        assert_eq!(parse_publish_subtopic(&s).unwrap(), "temp.room1");
        let (c, s) = parse_channel_topic("channels/ch-2/messages").unwrap();
        assert_eq!((c.as_ref(), s.as_str()), ("ch-2", ""));
        let (_, s) = parse_channel_topic("channels/ch1/messages/a?x=1").unwrap();
        assert_eq!(s, "/a");
        assert!(parse_channel_topic("channels/ch1/message").is_err());
        assert!(parse_channel_topic("channels/ch1/messagesx").is_err());
        assert!(parse_channel_topic("things/ch1/messages").is_err());
    }
}
