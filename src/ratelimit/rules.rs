//! Route cost rules and most-specific-match resolution.
//!
//! Each registered rule maps a (method, path pattern, header constraints)
//! combination to a cost weight. Rules live in an immutable, pre-sorted
//! snapshot that is swapped wholesale on every registration, so resolution
//! never waits on a writer and never sees a half-built table.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::debug;

/// Cost charged when no rule matches a request.
pub const DEFAULT_COST: u64 = 1;

/// Specificity contributed by each header constraint. Must exceed any
/// realistic path length so header-qualified rules always rank first.
const HEADER_WEIGHT: usize = 1000;

/// A trailing separator turns a pattern into a prefix match.
const PATH_SEPARATOR: char = '/';

/// A single registered cost policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    /// HTTP method to match; empty matches any method
    pub method: String,
    /// Exact path, or a prefix when it ends with `/`
    pub path_pattern: String,
    /// Headers that must be present with exactly these values, keyed by
    /// lowercase name
    pub header_constraints: BTreeMap<String, String>,
    /// Units of budget consumed by a matching request
    pub cost: u64,
    specificity: usize,
}

impl RouteRule {
    /// Build a rule, deriving its specificity score. A zero cost is raised to 1
    /// and header names are lowercased.
    pub fn new(
        method: impl Into<String>,
        path_pattern: impl Into<String>,
        header_constraints: BTreeMap<String, String>,
        cost: u64,
    ) -> Self {
        let path_pattern = path_pattern.into();
        let header_constraints = normalize_headers(&header_constraints);
        let specificity = HEADER_WEIGHT
            .saturating_mul(header_constraints.len())
            .saturating_add(path_pattern.len());

        Self {
            method: method.into(),
            path_pattern,
            header_constraints,
            cost: cost.max(DEFAULT_COST),
            specificity,
        }
    }

    /// `1000 × header constraints + pattern length`.
    pub fn specificity(&self) -> usize {
        self.specificity
    }

    /// Whether the pattern is a prefix match rather than an exact match.
    pub fn is_prefix(&self) -> bool {
        self.path_pattern.ends_with(PATH_SEPARATOR)
    }

    /// Check whether a request is covered by this rule.
    pub fn matches(&self, method: &str, path: &str, headers: &HashMap<String, String>) -> bool {
        if !self.method.is_empty() && self.method != method {
            return false;
        }

        let headers_match = self
            .header_constraints
            .iter()
            .all(|(name, value)| header_value(headers, name).is_some_and(|v| v == value));
        if !headers_match {
            return false;
        }

        self.matches_path(path)
    }

    fn matches_path(&self, path: &str) -> bool {
        if self.is_prefix() {
            path.starts_with(self.path_pattern.as_str())
        } else {
            path == self.path_pattern
        }
    }

    fn same_identity(
        &self,
        method: &str,
        path_pattern: &str,
        header_constraints: &BTreeMap<String, String>,
    ) -> bool {
        self.method == method
            && self.path_pattern == path_pattern
            && &self.header_constraints == header_constraints
    }
}

/// Look up a header by its lowercase name, ignoring ASCII case as HTTP does.
///
/// An exact lowercase key wins; otherwise, among differently-cased
/// duplicates, the lexicographically smallest key wins.
fn header_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a String> {
    headers.get(name).or_else(|| {
        headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .min_by(|a, b| a.0.cmp(b.0))
            .map(|(_, v)| v)
    })
}

fn normalize_headers<'a, I>(headers: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    headers
        .into_iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
        .collect()
}

impl fmt::Display for RouteRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let method = if self.method.is_empty() { "*" } else { &self.method };
        write!(f, "{} {}", method, self.path_pattern)?;
        for (name, value) in &self.header_constraints {
            write!(f, " [{}={}]", name, value)?;
        }
        write!(f, " => {}", self.cost)
    }
}

/// Resolves requests to cost weights using the most specific matching rule.
///
/// Reads are a single atomic load of the current table and never block;
/// writes serialize on an internal mutex, build a new sorted table and
/// publish it with one atomic store.
#[derive(Debug)]
pub struct CostResolutionEngine {
    /// The published table, sorted by descending specificity
    snapshot: ArcSwap<Vec<RouteRule>>,
    /// Serializes registrations against each other
    writer: Mutex<()>,
}

impl CostResolutionEngine {
    /// Create an engine with no rules.
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Vec::new()),
            writer: Mutex::new(()),
        }
    }

    /// Register a cost rule.
    ///
    /// Rules with equal specificity keep their registration order, so the
    /// earlier registration wins a tie.
    pub fn register(
        &self,
        method: &str,
        path_pattern: &str,
        header_constraints: &HashMap<String, String>,
        cost: u64,
    ) -> RouteRule {
        let headers = normalize_headers(header_constraints);
        let rule = RouteRule::new(method, path_pattern, headers, cost);

        let _guard = self.writer.lock();
        let mut rules = Vec::clone(&self.snapshot.load());
        rules.push(rule.clone());
        // `sort_by` is stable: ties stay in registration order.
        rules.sort_by(|a, b| b.specificity.cmp(&a.specificity));
        self.publish(rules);

        debug!(rule = %rule, specificity = rule.specificity, "Registered route cost rule");
        rule
    }

    /// Remove every rule with exactly this method, pattern and header set.
    ///
    /// Returns the number of rules removed.
    pub fn unregister(
        &self,
        method: &str,
        path_pattern: &str,
        header_constraints: &HashMap<String, String>,
    ) -> usize {
        let headers = normalize_headers(header_constraints);

        let _guard = self.writer.lock();
        let current = self.snapshot.load_full();
        let remaining: Vec<RouteRule> = current
            .iter()
            .filter(|r| !r.same_identity(method, path_pattern, &headers))
            .cloned()
            .collect();
        let removed = current.len() - remaining.len();

        if removed > 0 {
            self.publish(remaining);
            debug!(
                method = %method,
                path_pattern = %path_pattern,
                removed = removed,
                "Unregistered route cost rules"
            );
        }
        removed
    }

    /// Resolve the cost of a request.
    ///
    /// The first rule in specificity order that matches wins; with no match
    /// the cost is [`DEFAULT_COST`].
    pub fn resolve(&self, method: &str, path: &str, headers: &HashMap<String, String>) -> u64 {
        self.snapshot
            .load()
            .iter()
            .find(|rule| rule.matches(method, path, headers))
            .map_or(DEFAULT_COST, |rule| rule.cost)
    }

    /// The current rule table, most specific first.
    pub fn rules(&self) -> Arc<Vec<RouteRule>> {
        self.snapshot.load_full()
    }

    /// Number of registered rules.
    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish(&self, rules: Vec<RouteRule>) {
        self.snapshot.store(Arc::new(rules));
    }
}

impl Default for CostResolutionEngine {
    fn default() -> Self {
        Self::new()
    }
}
