use std::fmt;
use std::sync::Arc;

use stepflow_core::types::Message;

/// Guard of a conditional edge.
///
/// A plain function pointer, so it cannot capture run state or any mutable
/// environment: routing depends on the message alone and replays identically
/// from a checkpoint.
pub type Predicate = fn(&Message) -> bool;

/// Picks a subset of `candidates` for a multi-selection edge group.
/// Same purity rule as [`Predicate`].
pub type Selector = fn(&Message, &[String]) -> Vec<String>;

/// How an edge decides whether to carry a message.
#[derive(Clone)]
pub enum EdgeKind {
    /// Always forwards.
    Direct,
    /// Forwards when the predicate holds for the message.
    Conditional(Predicate),
    /// One of several unconditional edges replicating a message.
    FanOut,
    /// One inbound edge of a fan-in group; the target runs once every edge of
    /// the group has delivered.
    FanIn,
    /// One edge of a multi-selection group; forwards when the selector picks
    /// this edge's target.
    Selection {
        selector: Selector,
        candidates: Arc<[String]>,
    },
}

impl EdgeKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Conditional(_) => "conditional",
            Self::FanOut => "fan_out",
            Self::FanIn => "fan_in",
            Self::Selection { .. } => "selection",
        }
    }
}

impl fmt::Debug for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Selection { candidates, .. } => f
                .debug_struct("Selection")
                .field("candidates", candidates)
                .finish(),
            other => f.write_str(other.name()),
        }
    }
}

/// A directed edge between two executors.
#[derive(Debug, Clone)]
pub struct Edge {
    /// Source executor id.
    pub source: String,
    /// Target executor id.
    pub target: String,
    pub kind: EdgeKind,
    /// Explicit self-loop back-edge (source == target) used for iteration.
    pub loop_back: bool,
}

impl Edge {
    /// Create an unconditional edge.
    pub fn direct(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::with_kind(source, target, EdgeKind::Direct)
    }

    /// Create an edge guarded by a predicate over the message.
    pub fn conditional(
        source: impl Into<String>,
        target: impl Into<String>,
        predicate: Predicate,
    ) -> Self {
        Self::with_kind(source, target, EdgeKind::Conditional(predicate))
    }

    /// Create one edge of a fan-out set.
    pub fn fan_out(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::with_kind(source, target, EdgeKind::FanOut)
    }

    /// Create one inbound edge of a fan-in group.
    pub fn fan_in(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::with_kind(source, target, EdgeKind::FanIn)
    }

    /// Create a self-loop on `node`, optionally guarded.
    pub fn loop_back(node: impl Into<String>, predicate: Option<Predicate>) -> Self {
        let node = node.into();
        let kind = match predicate {
            Some(p) => EdgeKind::Conditional(p),
            None => EdgeKind::Direct,
        };
        Self {
            source: node.clone(),
            target: node,
            kind,
            loop_back: true,
        }
    }

    /// Create one edge of a multi-selection group over `candidates`.
    pub fn selection(
        source: impl Into<String>,
        target: impl Into<String>,
        selector: Selector,
        candidates: Arc<[String]>,
    ) -> Self {
        Self::with_kind(
            source,
            target,
            EdgeKind::Selection {
                selector,
                candidates,
            },
        )
    }

    fn with_kind(source: impl Into<String>, target: impl Into<String>, kind: EdgeKind) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            kind,
            loop_back: false,
        }
    }

    pub fn is_fan_in(&self) -> bool {
        matches!(self.kind, EdgeKind::FanIn)
    }

    /// Whether this edge carries `message`. Pure: depends only on the edge
    /// and the message.
    pub fn routes(&self, message: &Message) -> bool {
        match &self.kind {
            EdgeKind::Direct | EdgeKind::FanOut | EdgeKind::FanIn => true,
            EdgeKind::Conditional(predicate) => predicate(message),
            EdgeKind::Selection {
                selector,
                candidates,
            } => selector(message, candidates).contains(&self.target),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_enough(m: &Message) -> bool {
        m.as_text().is_some_and(|t| t.len() >= 10)
    }

    fn pick_first(_: &Message, candidates: &[String]) -> Vec<String> {
        candidates.iter().take(1).cloned().collect()
    }

    #[test]
    fn test_edge_builders() {
        let e = Edge::direct("a", "b");
        assert_eq!(e.source, "a");
        assert_eq!(e.target, "b");
        assert!(matches!(e.kind, EdgeKind::Direct));
        assert!(!e.loop_back);

        assert!(Edge::fan_in("a", "c").is_fan_in());
        assert!(matches!(Edge::fan_out("a", "d").kind, EdgeKind::FanOut));

        let l = Edge::loop_back("n", None);
        assert_eq!(l.source, l.target);
        assert!(l.loop_back);
    }

    #[test]
    fn test_conditional_routing() {
        let e = Edge::conditional("judge", "output", long_enough);
        assert!(!e.routes(&Message::text("short")));
        assert!(e.routes(&Message::text("long enough!")));
        assert!(!e.routes(&Message::Json(serde_json::json!({"text": "long enough!"}))));
    }

    #[test]
    fn test_routing_is_repeatable() {
        let e = Edge::conditional("judge", "output", long_enough);
        let message = Message::text("0123456789");
        let first = e.routes(&message);
        for _ in 0..100 {
            assert_eq!(e.routes(&message), first);
        }
    }

    #[test]
    fn test_selection_routing() {
        let candidates: Arc<[String]> = vec!["x".to_string(), "y".to_string()].into();
        let to_x = Edge::selection("s", "x", pick_first, candidates.clone());
        let to_y = Edge::selection("s", "y", pick_first, candidates);
        let m = Message::text("anything");
        assert!(to_x.routes(&m));
        assert!(!to_y.routes(&m));
    }

    #[test]
    fn test_unconditional_kinds_always_route() {
        let m = Message::Json(serde_json::json!(null));
        assert!(Edge::direct("a", "b").routes(&m));
        assert!(Edge::fan_out("a", "b").routes(&m));
        assert!(Edge::fan_in("a", "b").routes(&m));
    }

    #[test]
    fn test_kind_debug_names() {
        assert_eq!(format!("{:?}", EdgeKind::Direct), "direct");
        assert_eq!(format!("{:?}", EdgeKind::Conditional(long_enough)), "conditional");
    }
}
