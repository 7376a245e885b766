use std::collections::HashMap;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::DfsPostOrder;

use crate::scanner::ModuleDependency;

/// Orders `modules` so that every module comes after its dependencies.
/// Returns indices into `modules`.
///
/// Uses an iterative depth-first post-order walk over the reported edges, so
/// deep module graphs don't exhaust the stack. Each module identity is
/// visited once, later duplicates of an identity are dropped. Edges to
/// modules missing from the list are ignored here, registering the dependent
/// module reports them.
pub(crate) fn topological_order(modules: &[ModuleDependency], already_sorted: bool) -> Vec<usize> {
    if already_sorted {
        return (0..modules.len()).collect();
    }

    let mut graph = DiGraph::<usize, ()>::with_capacity(modules.len(), 0);
    let mut ids = HashMap::<String, NodeIndex>::with_capacity(modules.len());

    for (index, module) in modules.iter().enumerate() {
        ids.entry(module.id()).or_insert_with(|| graph.add_node(index));
    }

    for (index, module) in modules.iter().enumerate() {
        let node = ids[&module.id()];
        if graph[node] != index {
            continue;
        }

        for dep in &module.module_deps {
            if let Some(&target) = ids.get(dep) {
                graph.add_edge(node, target, ());
            }
        }
    }

    let mut order = Vec::with_capacity(graph.node_count());
    let mut dfs = DfsPostOrder::empty(&graph);

    for start in graph.node_indices() {
        dfs.move_to(start);
        while let Some(node) = dfs.next(&graph) {
            order.push(graph[node]);
        }
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::module;

    fn names(modules: &[ModuleDependency], order: &[usize]) -> Vec<String> {
        order.iter().map(|&i| modules[i].name.clone()).collect()
    }

    #[test]
    fn test_dependencies_come_first() {
        let modules = vec![
            module("B", "1", &["A:1"]),
            module("A", "1", &[]),
        ];

        let order = topological_order(&modules, false);
        assert_eq!(names(&modules, &order), ["A", "B"]);
    }

    #[test]
    fn test_diamond_visits_shared_dependency_once() {
        let modules = vec![
            module("Top", "1", &["Left:1", "Right:1"]),
            module("Left", "1", &["Base:1"]),
            module("Right", "1", &["Base:1"]),
            module("Base", "1", &[]),
        ];

        let order = names(&modules, &topological_order(&modules, false));
        let position = |name: &str| order.iter().position(|n| n == name).unwrap();

        assert_eq!(order.len(), 4);
        assert_eq!(position("Base"), 0);
        assert!(position("Left") < position("Top"));
        assert!(position("Right") < position("Top"));
    }

    #[test]
    fn test_sorted_input_is_kept() {
        let modules = vec![
            module("B", "1", &["A:1"]),
            module("A", "1", &[]),
        ];

        assert_eq!(topological_order(&modules, true), [0, 1]);
    }

    #[test]
    fn test_context_hash_distinguishes_modules() {
        let modules = vec![
            module("A", "2", &["A:1"]),
            module("A", "1", &[]),
        ];

        let order = topological_order(&modules, false);
        assert_eq!(order, [1, 0]);
    }

    #[test]
    fn test_deep_chain_does_not_recurse() {
        let depth = 50_000;
        let modules: Vec<_> = (0..depth)
            .map(|i| {
                let dep = (i + 1 < depth).then(|| format!("M{}:h", i + 1));
                let deps: Vec<&str> = dep.iter().map(String::as_str).collect();
                module(&format!("M{i}"), "h", &deps)
            })
            .collect();

        let order = topological_order(&modules, false);
        assert_eq!(order.len(), depth);
        assert_eq!(order[0], depth - 1);
        assert_eq!(order[depth - 1], 0);
    }

    #[test]
    fn test_unknown_dependency_is_left_to_registration() {
        let modules = vec![module("B", "1", &["Missing:1"]), module("A", "1", &[])];

        assert_eq!(topological_order(&modules, false), [0, 1]);
    }
}
