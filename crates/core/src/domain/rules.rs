//! Routing rules: pattern → channel
//!
//! Rules are kept in insertion order and tested oldest-first; the first rule
//! whose pattern matches wins. Patterns are case-insensitive regular
//! expressions tested against both the application name and the process name.

use crate::domain::channel::ChannelId;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// A single routing rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub pattern: String,
    pub channel: ChannelId,
}

impl RoutingRule {
    pub fn new(pattern: impl Into<String>, channel: ChannelId) -> Self {
        Self {
            pattern: pattern.into(),
            channel,
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: RoutingRule,
    /// `None` when the pattern is not a valid expression; such a rule never matches
    regex: Option<Regex>,
}

impl CompiledRule {
    fn compile(rule: RoutingRule) -> Self {
        let regex = match RegexBuilder::new(&rule.pattern).case_insensitive(true).build() {
            Ok(regex) => Some(regex),
            Err(e) => {
                warn!(pattern = %rule.pattern, error = %e, "Routing rule pattern does not compile, it will never match");
                None
            }
        };
        Self { rule, regex }
    }

    fn matches(&self, app_name: &str, process_name: &str) -> bool {
        self.regex
            .as_ref()
            .is_some_and(|re| re.is_match(app_name) || re.is_match(process_name))
    }
}

/// Ordered set of routing rules, unique by pattern
#[derive(Debug, Clone, Default)]
pub struct RoutingRuleStore {
    rules: Vec<CompiledRule>,
}

impl RoutingRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a rule, replacing any rule with the same pattern
    ///
    /// The channel is not validated here: rules may be restored before the
    /// channels exist, and are checked when applied.
    pub fn add(&mut self, pattern: impl Into<String>, channel: ChannelId) {
        let rule = RoutingRule::new(pattern, channel);
        self.rules.retain(|r| r.rule.pattern != rule.pattern);
        info!(pattern = %rule.pattern, channel = %rule.channel, "Added routing rule");
        self.rules.push(CompiledRule::compile(rule));
    }

    /// Remove the rule with this pattern; returns whether one was removed
    pub fn remove(&mut self, pattern: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.rule.pattern != pattern);
        let removed = self.rules.len() != before;
        if removed {
            info!(pattern, "Removed routing rule");
        }
        removed
    }

    /// Rules in evaluation order
    pub fn iter(&self) -> impl Iterator<Item = &RoutingRule> {
        self.rules.iter().map(|r| &r.rule)
    }

    pub fn rules(&self) -> Vec<RoutingRule> {
        self.iter().cloned().collect()
    }

    /// First rule matching either name
    pub fn first_match(&self, app_name: &str, process_name: &str) -> Option<&RoutingRule> {
        self.rules
            .iter()
            .find(|r| r.matches(app_name, process_name))
            .map(|r| &r.rule)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
