//! Publish/subscribe channel the engine talks through.
//!
//! Topics are `/`-separated levels. Subscription patterns accept `+` for
//! exactly one level and a trailing `#` for any number of remaining levels.

pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;

pub use self::memory::MemoryChannel;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("invalid topic pattern '{0}'")]
    InvalidPattern(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

/// One delivered message.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
}

pub type Subscription = BoxStream<'static, Message>;

#[async_trait]
pub trait Channel: Send + Sync {
    /// Hand `payload` to the transport. `Ok` means accepted, not delivered.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), ChannelError>;

    /// Stream of messages whose topic matches `pattern`.
    async fn subscribe(&self, pattern: &str) -> Result<Subscription, ChannelError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Level {
    Exact(String),
    Single,
    Rest,
}

/// Parsed subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    levels: Vec<Level>,
}

impl TopicFilter {
    pub fn parse(pattern: &str) -> Result<Self, ChannelError> {
        if pattern.is_empty() {
            return Err(ChannelError::InvalidPattern(pattern.to_string()));
        }
        let parts: Vec<&str> = pattern.split('/').collect();
        let mut levels = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let level = match *part {
                "#" if i + 1 == parts.len() => Level::Rest,
                "+" => Level::Single,
                p if p.contains('#') || p.contains('+') => {
                    return Err(ChannelError::InvalidPattern(pattern.to_string()))
                }
                p => Level::Exact(p.to_string()),
            };
            levels.push(level);
        }
        Ok(Self { levels })
    }

    pub fn matches(&self, topic: &str) -> bool {
        let mut parts = topic.split('/');
        for level in &self.levels {
            match (level, parts.next()) {
                (Level::Rest, _) => return true,
                (Level::Single, Some(_)) => {}
                (Level::Exact(want), Some(got)) if want == got => {}
                _ => return false,
            }
        }
        parts.next().is_none()
    }
}

/// Topic naming convention shared with the telemetry source and dashboard.
pub mod topics {
    pub fn sensors(namespace: &str, machine_id: &str) -> String {
        format!("{}/machines/{}/sensors", namespace, machine_id)
    }

    pub fn all_sensors(namespace: &str) -> String {
        format!("{}/machines/+/sensors", namespace)
    }

    pub fn alerts(namespace: &str) -> String {
        format!("{}/alerts/anomaly", namespace)
    }

    /// Machine id embedded in a sensor topic.
    pub fn machine_of(topic: &str) -> Option<&str> {
        let parts: Vec<&str> = topic.split('/').collect();
        match parts.as_slice() {
            [.., "machines", id, "sensors"] => Some(id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_level_wildcard() {
        let f = TopicFilter::parse("factory/machines/+/sensors").unwrap();
        assert!(f.matches("factory/machines/MACHINE_001/sensors"));
        assert!(!f.matches("factory/machines/MACHINE_001/sensors/extra"));
        assert!(!f.matches("factory/machines/sensors"));
        assert!(!f.matches("other/machines/M1/sensors"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        let f = TopicFilter::parse("factory/#").unwrap();
        assert!(f.matches("factory/alerts/anomaly"));
        assert!(f.matches("factory/machines/M1/sensors"));
        assert!(!f.matches("plant/alerts/anomaly"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(TopicFilter::parse("").is_err());
        assert!(TopicFilter::parse("factory/#/sensors").is_err());
        assert!(TopicFilter::parse("factory/mach+/sensors").is_err());
    }

    #[test]
    fn test_topic_helpers() {
        assert_eq!(topics::sensors("factory", "M1"), "factory/machines/M1/sensors");
        assert_eq!(topics::alerts("factory"), "factory/alerts/anomaly");
        assert_eq!(topics::machine_of("factory/machines/M1/sensors"), Some("M1"));
        assert_eq!(topics::machine_of("factory/alerts/anomaly"), None);
    }
}
