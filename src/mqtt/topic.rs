//! Topic patterns and command topic templates
//!
//! Only the single-level wildcard `+` is understood. A `<deviceId>`
//! placeholder in a pattern is treated as `+`.

const SINGLE_LEVEL: &str = "+";
const DEVICE_PLACEHOLDER: &str = "<deviceId>";
const CHANNEL_PLACEHOLDER: &str = "<channel>";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard,
}

/// Subscription pattern compiled into per-segment predicates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    filter: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    pub fn compile(pattern: &str) -> Self {
        let filter = pattern.replace(DEVICE_PLACEHOLDER, SINGLE_LEVEL);
        let segments = filter
            .split('/')
            .map(|segment| {
                if segment == SINGLE_LEVEL {
                    Segment::Wildcard
                } else {
                    Segment::Literal(segment.to_string())
                }
            })
            .collect();

        Self { filter, segments }
    }

    /// Filter string to hand to the broker when subscribing
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// True if `topic` matches segment for segment; a wildcard consumes
    /// exactly one non-empty segment
    pub fn matches(&self, topic: &str) -> bool {
        let mut parts = topic.split('/');

        for segment in &self.segments {
            match (segment, parts.next()) {
                (Segment::Wildcard, Some(part)) if !part.is_empty() => {}
                (Segment::Literal(literal), Some(part)) if literal == part => {}
                _ => return false,
            }
        }

        parts.next().is_none()
    }
}

/// Command address template with `<deviceId>` and `<channel>` placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTopicTemplate(String);

impl CommandTopicTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    pub fn render(&self, device_id: &str, channel: &str) -> String {
        self.0
            .replace(DEVICE_PLACEHOLDER, device_id)
            .replace(CHANNEL_PLACEHOLDER, channel)
    }
}
