//! Tests for the tri-color collector.
//!
//! Property tests compare the mark against a naive reachability search over
//! random graphs, including cyclic ones.

use magikd::gc::{self, Node, ResourceType};
use magikd::Error;
use proptest::prelude::*;
use std::collections::{HashMap, HashSet, VecDeque};

fn node(i: u8) -> Node {
    let kind = match i % 3 {
        0 => ResourceType::CONTENT,
        1 => ResourceType::SNAPSHOT,
        _ => ResourceType::IMAGE,
    };
    Node::new(kind, "ns1", format!("key-{i}"))
}

fn graph(edges: &[(u8, u8)]) -> HashMap<Node, Vec<Node>> {
    let mut graph: HashMap<Node, Vec<Node>> = HashMap::new();
    for (from, to) in edges {
        graph.entry(node(*from)).or_default().push(node(*to));
    }
    graph
}

fn resolver(graph: &HashMap<Node, Vec<Node>>) -> impl Fn(&Node) -> magikd::Result<Vec<Node>> + '_ {
    move |n: &Node| Ok(graph.get(n).cloned().unwrap_or_default())
}

fn naive_reachable(graph: &HashMap<Node, Vec<Node>>, roots: &[Node]) -> HashSet<Node> {
    let mut seen: HashSet<Node> = roots.iter().cloned().collect();
    let mut queue: VecDeque<Node> = roots.iter().cloned().collect();
    while let Some(n) = queue.pop_front() {
        for target in graph.get(&n).into_iter().flatten() {
            if seen.insert(target.clone()) {
                queue.push_back(target.clone());
            }
        }
    }
    seen
}

// =============================================================================
// Reachability Properties
// =============================================================================

proptest! {
    #[test]
    fn prop_mark_matches_naive_search(
        edges in prop::collection::vec((0u8..24, 0u8..24), 0..64),
        roots in prop::collection::vec(0u8..24, 0..6),
    ) {
        let graph = graph(&edges);
        let roots: Vec<Node> = roots.into_iter().map(node).collect();

        let marked = gc::tricolor(roots.clone(), &resolver(&graph)).unwrap();

        prop_assert_eq!(marked, naive_reachable(&graph, &roots));
    }

    #[test]
    fn prop_mark_is_closed_under_references(
        edges in prop::collection::vec((0u8..16, 0u8..16), 0..48),
        roots in prop::collection::vec(0u8..16, 1..4),
    ) {
        let graph = graph(&edges);
        let roots: Vec<Node> = roots.into_iter().map(node).collect();
        let marked = gc::tricolor(roots.clone(), &resolver(&graph)).unwrap();

        for root in &roots {
            prop_assert!(marked.contains(root));
        }
        for n in &marked {
            for target in graph.get(n).into_iter().flatten() {
                prop_assert!(marked.contains(target), "{} -> {} escaped the mark", n, target);
            }
        }
    }

    #[test]
    fn prop_sweep_removes_exact_complement(
        edges in prop::collection::vec((0u8..16, 0u8..16), 0..48),
        roots in prop::collection::vec(0u8..16, 0..4),
    ) {
        let graph = graph(&edges);
        let roots: Vec<Node> = roots.into_iter().map(node).collect();
        let marked = gc::tricolor(roots, &resolver(&graph)).unwrap();

        let all: Vec<Node> = (0u8..16).map(node).collect();
        let mut removed = HashSet::new();
        let count = gc::sweep(&marked, all.clone(), |n| {
            removed.insert(n.clone());
            Ok(())
        })
        .unwrap();

        prop_assert_eq!(count, removed.len());
        for n in all {
            prop_assert_ne!(marked.contains(&n), removed.contains(&n));
        }
    }

    #[test]
    fn prop_strip_is_idempotent(kind in 0u8..=255) {
        let t = ResourceType(kind);
        prop_assert_eq!(t.strip(), t.strip().strip());
        prop_assert!(t.strip().0 <= ResourceType::MAX);
        prop_assert_eq!(t.tagged(ResourceType::FLAT).strip(), t.strip());
    }
}

// =============================================================================
// Edge Cases
// =============================================================================

#[test]
fn test_self_loop_and_cycle() {
    let graph = graph(&[(0, 0), (1, 2), (2, 3), (3, 1)]);
    let marked = gc::tricolor([node(1)], &resolver(&graph)).unwrap();

    let expected: HashSet<Node> = [node(1), node(2), node(3)].into_iter().collect();
    assert_eq!(marked, expected);
}

#[test]
fn test_no_roots_marks_nothing() {
    let graph = graph(&[(0, 1)]);
    let marked = gc::tricolor(Vec::new(), &resolver(&graph)).unwrap();
    assert!(marked.is_empty());
}

#[test]
fn test_tagged_root_counts_as_untagged() {
    let tagged = Node {
        kind: ResourceType::CONTENT.tagged(ResourceType::FLAT),
        ..node(0)
    };
    let marked = gc::tricolor([tagged], &|_: &Node| -> magikd::Result<Vec<Node>> { Ok(Vec::new()) }).unwrap();
    assert!(marked.contains(&node(0)));
    assert_eq!(marked.len(), 1);
}

#[test]
fn test_resolver_failure_yields_no_partial_mark() {
    let failing = |n: &Node| -> magikd::Result<Vec<Node>> {
        if n.key == "key-2" {
            Err(Error::InvalidArgument("unreadable labels".to_string()))
        } else {
            Ok(vec![node(2)])
        }
    };
    assert!(gc::tricolor([node(0)], &failing).is_err());
}

#[test]
fn test_resource_type_display() {
    assert_eq!(ResourceType::CONTENT.to_string(), "content");
    assert_eq!(ResourceType::LEASE.tagged(ResourceType::FLAT).to_string(), "lease");
    assert_eq!(node(0).to_string(), "content/ns1/key-0");
}
