use crate::dispatch::CallOutcome;
use crate::protocol::CorrelationId;
use serde_json::Value;

const MAX_LOGGED_VALUE_CHARS: usize = 256;

/// A call-name pattern. `*` matches any run of characters, `?` exactly one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceRule {
    Exact(String),
    Wildcard(String),
}

impl TraceRule {
    pub fn parse(pattern: &str) -> Self {
        if pattern.contains(['*', '?']) {
            TraceRule::Wildcard(pattern.to_string())
        } else {
            TraceRule::Exact(pattern.to_string())
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            TraceRule::Exact(exact) => exact == name,
            TraceRule::Wildcard(pattern) => wildcard_match(pattern, name),
        }
    }
}

/// Observational call/return logging. Never changes what a call does.
#[derive(Debug, Clone, Default)]
pub struct TraceFilter {
    rules: Vec<TraceRule>,
}

impl TraceFilter {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut filter = Self::default();
        filter.replace(patterns);
        filter
    }

    pub fn replace<I, S>(&mut self, patterns: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.rules = patterns
            .into_iter()
            .map(|pattern| TraceRule::parse(pattern.as_ref()))
            .collect();
    }

    pub fn is_active(&self) -> bool {
        !self.rules.is_empty()
    }

    pub fn rules(&self) -> &[TraceRule] {
        &self.rules
    }

    pub fn matches(&self, name: &str) -> bool {
        self.rules.iter().any(|rule| rule.matches(name))
    }

    pub fn log_call(&self, id: &CorrelationId, name: &str, args: &[Value]) {
        if self.matches(name) {
            let args = Value::Array(args.to_vec());
            tracing::info!(target: "vau::trace", "({id}) CALL {name}: {}", summarize(&args));
        }
    }

    pub fn log_return(&self, id: &CorrelationId, name: &str, outcome: &CallOutcome) {
        if !self.matches(name) {
            return;
        }

        match outcome {
            CallOutcome::Success(value) => {
                tracing::info!(target: "vau::trace", "({id}) RETURN {name}: {}", summarize(value));
            }
            CallOutcome::Failure(failure) => {
                tracing::info!(target: "vau::trace", "({id}) ERROR {name}: {failure}");
            }
            CallOutcome::Retry { resource } => {
                tracing::info!(target: "vau::trace", "({id}) DEFER {name}: waiting on {resource}");
            }
        }
    }
}

fn summarize(value: &Value) -> String {
    let rendered = value.to_string();
    match rendered.char_indices().nth(MAX_LOGGED_VALUE_CHARS) {
        Some((cut, _)) => format!("{}...", &rendered[..cut]),
        None => rendered,
    }
}

fn wildcard_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    let (mut p, mut n) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while n < name.len() {
        match pattern.get(p).copied() {
            Some('*') => {
                backtrack = Some((p, n));
                p += 1;
            }
            Some(c) if c == '?' || c == name[n] => {
                p += 1;
                n += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    n = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}
