//! Per-topic rate limiting of numeric publications

use crate::config::{RateLimitMode, RateLimitRule};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct TopicState {
    last_sent: Option<f64>,
    last_time: Option<Instant>,
    sum: f64,
    count: u32,
    latest: Option<f64>,
}

/// Decides which numeric values reach the broker
///
/// A value differing from the last published one by more than the rule's
/// margin goes out immediately. Otherwise values accumulate and one value
/// (latest or mean) is released per period. Topics without a rule always pass.
#[derive(Debug)]
pub struct RateLimiter {
    rules: Vec<RateLimitRule>,
    topics: HashMap<String, TopicState>,
}

impl RateLimiter {
    pub fn new(rules: &[RateLimitRule]) -> Self {
        let mut rules = rules.to_vec();
        // Longest prefix first
        rules.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self {
            rules,
            topics: HashMap::new(),
        }
    }

    fn rule_for(&self, topic: &str) -> Option<&RateLimitRule> {
        self.rules.iter().find(|r| topic.starts_with(&r.prefix))
    }

    /// Offer a value; returns the value to publish now, if any
    pub fn offer(&mut self, topic: &str, value: f64, now: Instant) -> Option<f64> {
        let Some(rule) = self.rule_for(topic).cloned() else {
            return Some(value);
        };
        let state = self.topics.entry(topic.to_string()).or_default();
        let jump = match state.last_sent {
            None => true,
            Some(last) => (value - last).abs() > rule.margin || value.is_nan() != last.is_nan(),
        };
        if jump {
            Self::mark_sent(state, value, now);
            return Some(value);
        }
        state.sum += value;
        state.count += 1;
        state.latest = Some(value);
        Self::release(state, &rule, now)
    }

    /// Values whose period has elapsed since the last publication
    pub fn due(&mut self, now: Instant) -> Vec<(String, f64)> {
        let mut out = Vec::new();
        for (topic, state) in self.topics.iter_mut() {
            let Some(rule) = self
                .rules
                .iter()
                .find(|r| topic.starts_with(&r.prefix))
                .cloned()
            else {
                continue;
            };
            if let Some(v) = Self::release(state, &rule, now) {
                out.push((topic.clone(), v));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Forget a topic so its next value publishes immediately
    pub fn reset(&mut self, topic: &str) {
        self.topics.remove(topic);
    }

    fn release(state: &mut TopicState, rule: &RateLimitRule, now: Instant) -> Option<f64> {
        if state.count == 0 {
            return None;
        }
        let last_time = state.last_time?;
        if now.duration_since(last_time) < Duration::from_secs_f64(rule.period_s.max(0.0)) {
            return None;
        }
        let value = match rule.mode {
            RateLimitMode::Average => state.sum / state.count as f64,
            RateLimitMode::Latest => state.latest?,
        };
        Self::mark_sent(state, value, now);
        Some(value)
    }

    fn mark_sent(state: &mut TopicState, value: f64, now: Instant) {
        state.last_sent = Some(value);
        state.last_time = Some(now);
        state.sum = 0.0;
        state.count = 0;
        state.latest = None;
    }
}
