//! Destination bindings and concurrency ranges.

use crate::error::{JmsError, Result};
use crate::message::{BodyKind, Destination, DestinationType};
use crate::protocol::{AcknowledgeMode, ConsumerOptions, Subscription};
use crate::selector::Selector;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::str::FromStr;

static CONCURRENCY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)-(\d+)$").expect("concurrency pattern is valid"));

/// Immutable description of a queue or topic binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationDescriptor {
    name: String,
    kind: DestinationType,
    acknowledge_mode: AcknowledgeMode,
    transacted: bool,
    selector: Option<String>,
    target: Option<BodyKind>,
    shared: bool,
    durable: bool,
    subscription_name: Option<String>,
}

impl DestinationDescriptor {
    pub fn new(kind: DestinationType, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            acknowledge_mode: AcknowledgeMode::Auto,
            transacted: false,
            selector: None,
            target: None,
            shared: false,
            durable: false,
            subscription_name: None,
        }
    }

    pub fn queue(name: impl Into<String>) -> Self {
        Self::new(DestinationType::Queue, name)
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self::new(DestinationType::Topic, name)
    }

    pub fn with_acknowledge_mode(mut self, mode: AcknowledgeMode) -> Self {
        self.acknowledge_mode = mode;
        self
    }

    pub fn transacted(mut self, transacted: bool) -> Self {
        self.transacted = transacted;
        self
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    /// Convert every delivered body to `kind` before the callback sees it.
    pub fn with_target(mut self, kind: BodyKind) -> Self {
        self.target = Some(kind);
        self
    }

    /// Topic only.
    pub fn shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    /// Topic only.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_subscription_name(mut self, name: impl Into<String>) -> Self {
        self.subscription_name = Some(name.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DestinationType {
        self.kind
    }

    pub fn destination(&self) -> Destination {
        Destination::of(self.kind, self.name.clone())
    }

    /// Transacted either explicitly or through [`AcknowledgeMode::Transacted`].
    pub fn is_transacted(&self) -> bool {
        self.transacted || self.acknowledge_mode == AcknowledgeMode::Transacted
    }

    pub fn acknowledge_mode(&self) -> AcknowledgeMode {
        if self.is_transacted() {
            AcknowledgeMode::Transacted
        } else {
            self.acknowledge_mode
        }
    }

    pub fn selector(&self) -> Option<&str> {
        self.selector.as_deref()
    }

    pub fn target(&self) -> Option<BodyKind> {
        self.target
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Subscription name for shared/durable topics; defaults to the topic name.
    pub fn subscription_name(&self) -> &str {
        self.subscription_name.as_deref().unwrap_or(&self.name)
    }

    pub fn subscription(&self) -> Subscription {
        let name = self.subscription_name().to_string();
        match (self.shared, self.durable) {
            (false, false) => Subscription::None,
            (true, false) => Subscription::Shared(name),
            (false, true) => Subscription::Durable(name),
            (true, true) => Subscription::SharedDurable(name),
        }
    }

    pub fn consumer_options(&self) -> ConsumerOptions {
        ConsumerOptions {
            selector: self.selector.clone(),
            subscription: self.subscription(),
        }
    }

    /// Reject bindings the broker would refuse anyway.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(JmsError::Config("destination name is empty".into()));
        }
        if self.kind == DestinationType::Queue && (self.shared || self.durable) {
            return Err(JmsError::Config(format!(
                "queue '{}' cannot be shared or durable; only topics have subscriptions",
                self.name
            )));
        }
        if let Some(selector) = &self.selector {
            Selector::parse(selector)?;
        }
        Ok(())
    }
}

impl fmt::Display for DestinationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.kind, self.name)
    }
}

/// Worker range of a dispatch executor, written `min-max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Concurrency {
    min: usize,
    max: usize,
}

impl Concurrency {
    pub fn new(min: usize, max: usize) -> Result<Self> {
        if min == 0 || min > max {
            return Err(JmsError::InvalidConcurrency(format!("{}-{}", min, max)));
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> usize {
        self.min
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

impl Default for Concurrency {
    fn default() -> Self {
        Self { min: 1, max: 1 }
    }
}

impl FromStr for Concurrency {
    type Err = JmsError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || JmsError::InvalidConcurrency(s.to_string());
        let captures = CONCURRENCY_PATTERN.captures(s.trim()).ok_or_else(invalid)?;
        let min = captures[1].parse().map_err(|_| invalid())?;
        let max = captures[2].parse().map_err(|_| invalid())?;
        Self::new(min, max).map_err(|_| invalid())
    }
}

impl fmt::Display for Concurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrency_parsing() {
        let c: Concurrency = "2-4".parse().unwrap();
        assert_eq!((c.min(), c.max()), (2, 4));
        assert_eq!(c.to_string(), "2-4");

        for bad in ["4", "0-1", "3-2", "a-b", "1 - 2", "-1-2", ""] {
            assert!(
                matches!(bad.parse::<Concurrency>(), Err(JmsError::InvalidConcurrency(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_transacted_descriptor_forces_transacted_mode() {
        let d = DestinationDescriptor::queue("orders")
            .with_acknowledge_mode(AcknowledgeMode::Client)
            .transacted(true);
        assert!(d.is_transacted());
        assert_eq!(d.acknowledge_mode(), AcknowledgeMode::Transacted);
    }

    #[test]
    fn test_topic_subscription_flags() {
        let d = DestinationDescriptor::topic("prices").shared(true).durable(true);
        assert!(d.validate().is_ok());
        assert_eq!(d.subscription(), Subscription::SharedDurable("prices".into()));

        let d = d.with_subscription_name("audit");
        assert_eq!(d.consumer_options().subscription.name(), Some("audit"));
    }

    #[test]
    fn test_queue_cannot_be_durable() {
        let err = DestinationDescriptor::queue("orders")
            .durable(true)
            .validate()
            .unwrap_err();
        assert!(matches!(err, JmsError::Config(_)));
    }

    #[test]
    fn test_invalid_selector_rejected() {
        let err = DestinationDescriptor::queue("orders")
            .with_selector("flag = ")
            .validate()
            .unwrap_err();
        assert!(matches!(err, JmsError::InvalidSelector { .. }));
        assert_eq!(
            DestinationDescriptor::topic("t").to_string(),
            "topic://t"
        );
    }
}
