//! Graph edge utilities for the `graph_edges` JSONB arrays.

use crate::entity::GraphEdge;

/// Merge `new_edges` into `existing`, deduplicating by `(target, relation)`.
/// When a pair already exists the higher weight wins; non-conflicting edges
/// are appended in encounter order.
pub fn merge_graph_edges(existing: &[GraphEdge], new_edges: &[GraphEdge]) -> Vec<GraphEdge> {
    let mut merged: Vec<GraphEdge> = Vec::with_capacity(existing.len() + new_edges.len());

    for edge in existing.iter().chain(new_edges.iter()) {
        match merged
            .iter_mut()
            .find(|e| e.target == edge.target && e.relation == edge.relation)
        {
            Some(slot) => {
                if edge.weight > slot.weight {
                    *slot = edge.clone();
                }
            }
            None => merged.push(edge.clone()),
        }
    }
    merged
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(target: &str, relation: &str, weight: f64) -> GraphEdge {
        GraphEdge {
            target: target.to_string(),
            relation: relation.to_string(),
            weight,
            reason: None,
        }
    }

    #[test]
    fn disjoint_edges_are_appended() {
        let merged = merge_graph_edges(
            &[edge("a", "related", 0.5)],
            &[edge("b", "related", 0.7)],
        );
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn same_target_relation_keeps_higher_weight() {
        let merged = merge_graph_edges(
            &[edge("a", "dreamed_from", 0.4)],
            &[edge("a", "dreamed_from", 0.9)],
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].weight, 0.9);

        // And the other direction: existing higher weight survives.
        let merged = merge_graph_edges(
            &[edge("a", "dreamed_from", 0.9)],
            &[edge("a", "dreamed_from", 0.4)],
        );
        assert_eq!(merged[0].weight, 0.9);
    }

    #[test]
    fn same_target_different_relation_are_distinct() {
        let merged = merge_graph_edges(
            &[edge("a", "related", 0.5)],
            &[edge("a", "dreamed_from", 0.5)],
        );
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn reason_travels_with_the_winning_edge() {
        let mut stronger = edge("a", "related", 0.8);
        stronger.reason = Some("shared topic".to_string());
        let merged = merge_graph_edges(&[edge("a", "related", 0.2)], &[stronger]);
        assert_eq!(merged[0].reason.as_deref(), Some("shared topic"));
    }
}
