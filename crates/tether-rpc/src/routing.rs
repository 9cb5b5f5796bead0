//! Route table and specificity-ordered matching.
//!
//! A route is a [`RouteMapping`] (the composite condition) plus a handler.
//! Resolving a request collects every mapping that matches, orders the
//! matches most-specific first, and settles exact ties with a [`TieBreak`]
//! policy.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::handler::MethodHandler;

/// The parts of an inbound call a condition may inspect.
#[derive(Clone, Copy, Debug)]
pub struct RequestHead<'a> {
    /// Method name.
    pub method: &'a str,
    /// Raw parameters.
    pub params: Option<&'a Value>,
}

impl<'a> RequestHead<'a> {
    /// Head for a method without looking at params.
    pub fn new(method: &'a str) -> Self {
        Self {
            method,
            params: None,
        }
    }

    /// Attach params.
    #[must_use]
    pub fn with_params(mut self, params: Option<&'a Value>) -> Self {
        self.params = params;
        self
    }
}

/// A composable predicate over inbound requests.
pub trait RequestCondition: Sized {
    /// Merge an outer (scope-level) condition with an inner one.
    fn combine(&self, other: &Self) -> Self;

    /// The condition as it applies to `head`, or `None` when it does not match.
    fn matching(&self, head: &RequestHead<'_>) -> Option<Self>;

    /// Order two conditions that both matched `head`. `Less` means `self`
    /// is more specific.
    fn compare(&self, other: &Self, head: &RequestHead<'_>) -> Ordering;
}

// ─────────────────────────────────────────────────────────────────────────────
// MethodsCondition
// ─────────────────────────────────────────────────────────────────────────────

/// Ordered, de-duplicated set of method names. Empty means "any method".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MethodsCondition {
    methods: Vec<String>,
}

impl MethodsCondition {
    /// Condition accepting exactly the given methods.
    pub fn new<I, S>(methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut condition = Self::default();
        for method in methods {
            condition.push(method.into());
        }
        condition
    }

    /// Catch-all condition.
    pub fn any() -> Self {
        Self::default()
    }

    fn push(&mut self, method: String) {
        if !self.methods.contains(&method) {
            self.methods.push(method);
        }
    }

    /// Accepted methods in declaration order.
    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    /// Whether this is the catch-all condition.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Whether `method` is listed explicitly.
    pub fn contains(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method)
    }
}

impl RequestCondition for MethodsCondition {
    fn combine(&self, other: &Self) -> Self {
        let mut combined = self.clone();
        for method in &other.methods {
            combined.push(method.clone());
        }
        combined
    }

    fn matching(&self, head: &RequestHead<'_>) -> Option<Self> {
        (self.is_empty() || self.contains(head.method)).then(|| self.clone())
    }

    fn compare(&self, other: &Self, _head: &RequestHead<'_>) -> Ordering {
        match (self.is_empty(), other.is_empty()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => self.methods.len().cmp(&other.methods.len()),
        }
    }
}

impl fmt::Display for MethodsCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("*");
        }
        write!(f, "{{{}}}", self.methods.join(", "))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RouteMapping
// ─────────────────────────────────────────────────────────────────────────────

/// The full condition registered for one handler.
///
/// New condition kinds become additional fields, each combined, matched and
/// compared in turn.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteMapping {
    methods: MethodsCondition,
}

impl RouteMapping {
    /// Mapping for a single method.
    pub fn method(method: impl Into<String>) -> Self {
        Self::methods([method.into()])
    }

    /// Mapping for a set of methods.
    pub fn methods<I, S>(methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            methods: MethodsCondition::new(methods),
        }
    }

    /// Mapping that matches every method.
    pub fn any() -> Self {
        Self::default()
    }

    /// The method-name part of the mapping.
    pub fn methods_condition(&self) -> &MethodsCondition {
        &self.methods
    }
}

impl RequestCondition for RouteMapping {
    fn combine(&self, other: &Self) -> Self {
        Self {
            methods: self.methods.combine(&other.methods),
        }
    }

    fn matching(&self, head: &RequestHead<'_>) -> Option<Self> {
        Some(Self {
            methods: self.methods.matching(head)?,
        })
    }

    fn compare(&self, other: &Self, head: &RequestHead<'_>) -> Ordering {
        self.methods.compare(&other.methods, head)
    }
}

impl fmt::Display for RouteMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.methods, f)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RouteTable
// ─────────────────────────────────────────────────────────────────────────────

/// How to settle two matches that compare equal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TieBreak {
    /// Fail the request with [`RouteError::Ambiguous`].
    #[default]
    Reject,
    /// The route registered first wins.
    FirstRegistered,
}

/// Why a request could not be routed.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RouteError {
    /// No mapping matches the method.
    #[error("no handler for method {method}")]
    NoHandlerFound {
        /// The unmatched method.
        method: String,
    },
    /// Two or more equally specific mappings match.
    #[error("ambiguous handler mapping for {method}: {}", .candidates.join(" | "))]
    Ambiguous {
        /// The requested method.
        method: String,
        /// The tied mappings, in registration order.
        candidates: Vec<String>,
    },
}

struct RouteEntry {
    mapping: RouteMapping,
    handler: Arc<dyn MethodHandler>,
}

/// Registered routes, built once at startup and shared read-only afterwards.
#[derive(Default)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
    tie_break: TieBreak,
}

impl RouteTable {
    /// Empty table with the default [`TieBreak::Reject`] policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty table with an explicit tie-break policy.
    pub fn with_tie_break(tie_break: TieBreak) -> Self {
        Self {
            entries: Vec::new(),
            tie_break,
        }
    }

    /// The active tie-break policy.
    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    /// Register a handler under a mapping.
    pub fn register(&mut self, mapping: RouteMapping, handler: impl MethodHandler + 'static) {
        self.register_arc(mapping, Arc::new(handler));
    }

    /// Register an already shared handler.
    pub fn register_arc(&mut self, mapping: RouteMapping, handler: Arc<dyn MethodHandler>) {
        self.entries.push(RouteEntry { mapping, handler });
    }

    /// Register a handler for one method name.
    pub fn route(&mut self, method: &str, handler: impl MethodHandler + 'static) {
        self.register(RouteMapping::method(method), handler);
    }

    /// Register under `scope` combined with `mapping` (a group-level
    /// constraint plus a handler-level one).
    pub fn register_scoped(
        &mut self,
        scope: &RouteMapping,
        mapping: &RouteMapping,
        handler: impl MethodHandler + 'static,
    ) {
        self.register(scope.combine(mapping), handler);
    }

    /// Find the handler for a request.
    pub fn resolve(&self, head: &RequestHead<'_>) -> Result<Arc<dyn MethodHandler>, RouteError> {
        // Stable sort keeps registration order among equal conditions.
        let mut matches: Vec<(RouteMapping, &RouteEntry)> = self
            .entries
            .iter()
            .filter_map(|entry| entry.mapping.matching(head).map(|m| (m, entry)))
            .collect();

        match matches.len() {
            0 => {
                return Err(RouteError::NoHandlerFound {
                    method: head.method.to_owned(),
                });
            }
            1 => return Ok(Arc::clone(&matches[0].1.handler)),
            _ => {}
        }

        matches.sort_by(|a, b| a.0.compare(&b.0, head));

        if matches[0].0.compare(&matches[1].0, head) == Ordering::Equal {
            match self.tie_break {
                TieBreak::Reject => {
                    let best = &matches[0].0;
                    let candidates = matches
                        .iter()
                        .take_while(|(m, _)| best.compare(m, head) == Ordering::Equal)
                        .map(|(_, entry)| entry.mapping.to_string())
                        .collect();
                    return Err(RouteError::Ambiguous {
                        method: head.method.to_owned(),
                        candidates,
                    });
                }
                TieBreak::FirstRegistered => {}
            }
        }

        Ok(Arc::clone(&matches[0].1.handler))
    }

    /// Every explicitly routed method name, sorted and de-duplicated.
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .iter()
            .flat_map(|e| e.mapping.methods.methods().iter().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Whether some mapping would accept `method`.
    pub fn has_method(&self, method: &str) -> bool {
        let head = RequestHead::new(method);
        self.entries.iter().any(|e| e.mapping.matching(&head).is_some())
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no routes are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteTable")
            .field(
                "routes",
                &self
                    .entries
                    .iter()
                    .map(|e| e.mapping.to_string())
                    .collect::<Vec<_>>(),
            )
            .field("tie_break", &self.tie_break)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RpcError;
    use crate::handler::RequestContext;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use serde_json::json;

    /// Answers with a fixed label so tests can tell which route won.
    struct Labeled(&'static str);

    #[async_trait]
    impl MethodHandler for Labeled {
        async fn handle(
            &self,
            _params: Option<Value>,
            _ctx: &RequestContext,
        ) -> Result<Value, RpcError> {
            Ok(json!(self.0))
        }
    }

    async fn winner(table: &RouteTable, method: &str) -> Value {
        let handler = table.resolve(&RequestHead::new(method)).unwrap();
        handler
            .handle(None, &RequestContext::detached(method))
            .await
            .unwrap()
    }

    // ── MethodsCondition ────────────────────────────────────────────

    #[test]
    fn methods_deduplicated_in_order() {
        let c = MethodsCondition::new(["b", "a", "b"]);
        assert_eq!(c.methods(), ["b", "a"]);
    }

    #[test]
    fn combine_is_ordered_union() {
        let outer = MethodsCondition::new(["a", "b"]);
        let inner = MethodsCondition::new(["b", "c"]);
        assert_eq!(outer.combine(&inner).methods(), ["a", "b", "c"]);
    }

    #[test]
    fn empty_condition_matches_everything() {
        let head = RequestHead::new("anything/goes");
        assert!(MethodsCondition::any().matching(&head).is_some());
    }

    #[test]
    fn non_member_does_not_match() {
        let head = RequestHead::new("c");
        assert!(MethodsCondition::new(["a", "b"]).matching(&head).is_none());
    }

    #[test]
    fn fewer_methods_is_more_specific() {
        let head = RequestHead::new("a");
        let one = MethodsCondition::new(["a"]);
        let two = MethodsCondition::new(["a", "b"]);
        assert_eq!(one.compare(&two, &head), Ordering::Less);
        assert_eq!(two.compare(&one, &head), Ordering::Greater);
        assert_eq!(one.compare(&one.clone(), &head), Ordering::Equal);
    }

    #[test]
    fn catch_all_ranks_last() {
        let head = RequestHead::new("a");
        let many = MethodsCondition::new(["a", "b", "c", "d"]);
        assert_eq!(MethodsCondition::any().compare(&many, &head), Ordering::Greater);
        assert_eq!(many.compare(&MethodsCondition::any(), &head), Ordering::Less);
    }

    #[test]
    fn display_forms() {
        assert_eq!(MethodsCondition::any().to_string(), "*");
        assert_eq!(MethodsCondition::new(["a", "b"]).to_string(), "{a, b}");
    }

    // ── RouteTable ──────────────────────────────────────────────────

    #[tokio::test]
    async fn narrower_set_wins() {
        let mut table = RouteTable::new();
        table.register(RouteMapping::methods(["a"]), Labeled("narrow"));
        table.register(RouteMapping::methods(["a", "b"]), Labeled("wide"));
        assert_eq!(winner(&table, "a").await, "narrow");
        assert_eq!(winner(&table, "b").await, "wide");
    }

    #[tokio::test]
    async fn narrower_set_wins_regardless_of_registration_order() {
        let mut table = RouteTable::new();
        table.register(RouteMapping::methods(["a", "b"]), Labeled("wide"));
        table.register(RouteMapping::methods(["a"]), Labeled("narrow"));
        assert_eq!(winner(&table, "a").await, "narrow");
    }

    #[tokio::test]
    async fn catch_all_used_only_as_fallback() {
        let mut table = RouteTable::new();
        table.register(RouteMapping::any(), Labeled("fallback"));
        table.route("textDocument/hover", Labeled("hover"));
        assert_eq!(winner(&table, "textDocument/hover").await, "hover");
        assert_eq!(winner(&table, "textDocument/definition").await, "fallback");
    }

    #[test]
    fn no_match_is_not_found() {
        let mut table = RouteTable::new();
        table.route("a", Labeled("a"));
        let err = table.resolve(&RequestHead::new("zzz")).err().unwrap();
        assert_eq!(
            err,
            RouteError::NoHandlerFound {
                method: "zzz".into()
            }
        );
    }

    #[test]
    fn tie_rejected_by_default() {
        let mut table = RouteTable::new();
        table.register(RouteMapping::methods(["a", "x"]), Labeled("first"));
        table.register(RouteMapping::methods(["a", "y"]), Labeled("second"));
        let err = table.resolve(&RequestHead::new("a")).err().unwrap();
        assert_matches!(err, RouteError::Ambiguous { ref method, ref candidates }
            if method == "a" && candidates == &["{a, x}".to_string(), "{a, y}".to_string()]);
    }

    #[tokio::test]
    async fn tie_resolved_by_registration_order() {
        let mut table = RouteTable::with_tie_break(TieBreak::FirstRegistered);
        table.register(RouteMapping::methods(["a", "x"]), Labeled("first"));
        table.register(RouteMapping::methods(["a", "y"]), Labeled("second"));
        assert_eq!(winner(&table, "a").await, "first");
    }

    #[tokio::test]
    async fn tie_below_the_winner_is_irrelevant() {
        let mut table = RouteTable::new();
        table.register(RouteMapping::methods(["a", "x"]), Labeled("wide-1"));
        table.register(RouteMapping::methods(["a", "y"]), Labeled("wide-2"));
        table.register(RouteMapping::method("a"), Labeled("exact"));
        assert_eq!(winner(&table, "a").await, "exact");
    }

    #[tokio::test]
    async fn scoped_registration_combines_conditions() {
        let mut table = RouteTable::new();
        let scope = RouteMapping::method("workspace/symbol");
        table.register_scoped(&scope, &RouteMapping::method("workspace/executeCommand"), Labeled("ws"));
        assert_eq!(winner(&table, "workspace/symbol").await, "ws");
        assert_eq!(winner(&table, "workspace/executeCommand").await, "ws");
        assert_eq!(
            table.methods(),
            vec!["workspace/executeCommand".to_string(), "workspace/symbol".to_string()]
        );
    }

    #[test]
    fn methods_sorted_and_unique() {
        let mut table = RouteTable::new();
        table.route("b", Labeled("b"));
        table.register(RouteMapping::methods(["a", "b"]), Labeled("ab"));
        table.register(RouteMapping::any(), Labeled("any"));
        assert_eq!(table.methods(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(table.len(), 3);
        assert!(table.has_method("whatever"));
    }

    #[test]
    fn empty_table() {
        let table = RouteTable::default();
        assert!(table.is_empty());
        assert!(!table.has_method("a"));
        assert_eq!(table.tie_break(), TieBreak::Reject);
    }
}
