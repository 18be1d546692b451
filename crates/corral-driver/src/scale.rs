//! Scale-down candidate selection.
//!
//! Pure decision logic, extracted so it can be tested without an engine:
//! which nodes go away when a node group shrinks.

use std::collections::HashSet;

/// Pick the nodes to remove when shrinking to `target_count`.
///
/// `current` is ordered oldest-first, as reported by the engine.
/// Selection order:
/// 1. Nodes explicitly requested for removal (that actually exist).
/// 2. Remaining delta newest-first, idle nodes before busy ones.
///
/// `busy` marks nodes hosting non-daemonset workload; the preference is
/// advisory only, so when every candidate is busy the newest busy nodes
/// are still removed.
pub fn select_nodes_for_removal(
    current: &[String],
    target_count: u32,
    requested: &[String],
    busy: &HashSet<String>,
) -> Vec<String> {
    let remove_count = current.len().saturating_sub(target_count as usize);
    if remove_count == 0 {
        return Vec::new();
    }

    let existing: HashSet<&str> = current.iter().map(String::as_str).collect();
    let mut chosen: Vec<String> = Vec::with_capacity(remove_count);
    let mut chosen_set: HashSet<&str> = HashSet::new();

    for node in requested {
        if chosen.len() == remove_count {
            break;
        }
        if existing.contains(node.as_str()) && chosen_set.insert(node.as_str()) {
            chosen.push(node.clone());
        }
    }

    // Fill the rest newest-first; busy nodes only after idle ones.
    for pass_busy in [false, true] {
        for node in current.iter().rev() {
            if chosen.len() == remove_count {
                break;
            }
            if chosen_set.contains(node.as_str()) {
                continue;
            }
            if busy.contains(node) == pass_busy {
                chosen_set.insert(node.as_str());
                chosen.push(node.clone());
            }
        }
    }

    chosen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn no_removal_when_growing_or_equal() {
        let current = nodes(&["n0", "n1"]);
        assert!(select_nodes_for_removal(&current, 2, &[], &HashSet::new()).is_empty());
        assert!(select_nodes_for_removal(&current, 5, &[], &HashSet::new()).is_empty());
    }

    #[test]
    fn newest_first_by_default() {
        let current = nodes(&["n0", "n1", "n2", "n3"]);
        let picked = select_nodes_for_removal(&current, 2, &[], &HashSet::new());
        assert_eq!(picked, nodes(&["n3", "n2"]));
    }

    #[test]
    fn requested_nodes_removed_exactly() {
        let current = nodes(&["n0", "n1", "n2", "n3"]);
        let picked = select_nodes_for_removal(&current, 2, &nodes(&["n0", "n1"]), &HashSet::new());
        assert_eq!(picked, nodes(&["n0", "n1"]));
    }

    #[test]
    fn requested_then_newest_fills_delta() {
        let current = nodes(&["n0", "n1", "n2", "n3"]);
        let picked = select_nodes_for_removal(&current, 1, &nodes(&["n1"]), &HashSet::new());
        assert_eq!(picked, nodes(&["n1", "n3", "n2"]));
    }

    #[test]
    fn unknown_requested_nodes_ignored() {
        let current = nodes(&["n0", "n1"]);
        let picked = select_nodes_for_removal(&current, 1, &nodes(&["ghost"]), &HashSet::new());
        assert_eq!(picked, nodes(&["n1"]));
    }

    #[test]
    fn busy_nodes_deprioritized_but_not_protected() {
        let current = nodes(&["n0", "n1", "n2", "n3"]);
        let busy: HashSet<String> = ["n3".to_string(), "n2".to_string()].into_iter().collect();

        // Idle nodes go first even though they are older
        let picked = select_nodes_for_removal(&current, 2, &[], &busy);
        assert_eq!(picked, nodes(&["n1", "n0"]));

        // When the delta exceeds the idle pool, busy nodes are removed too
        let picked = select_nodes_for_removal(&current, 1, &[], &busy);
        assert_eq!(picked, nodes(&["n1", "n0", "n3"]));
    }

    #[test]
    fn duplicate_requests_counted_once() {
        let current = nodes(&["n0", "n1", "n2"]);
        let picked =
            select_nodes_for_removal(&current, 1, &nodes(&["n0", "n0"]), &HashSet::new());
        assert_eq!(picked, nodes(&["n0", "n2"]));
    }
}
