//! Product priority assignment.
//!
//! Distinct from the artifact/rule-node [`crate::graph::BuildGraph`]: this
//! is the *product* dependency graph (e.g. "executable depends on static
//! library"), walked once at executor startup to derive the integer
//! priority used to order the ready queue. Uses the same index-handle-over
//! arena style as `BuildGraph` itself, scaled down since product
//! dependencies are a plain DAG with no file-tag matching involved.

use std::collections::{BTreeMap, BTreeSet};

use crate::graph::ProductId;

/// The dependency relation between products ("product A depends on product
/// B" — e.g. an executable depends on the static library it links). Used
/// only to assign scheduling priority; never persisted as part of the
/// build graph itself.
#[derive(Debug, Clone, Default)]
pub struct ProductGraph {
    products: BTreeSet<ProductId>,
    /// product -> the products it depends on.
    depends_on: BTreeMap<ProductId, BTreeSet<ProductId>>,
}

impl ProductGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_product(&mut self, product: ProductId) {
        self.products.insert(product);
    }

    pub fn add_dependency(&mut self, product: ProductId, depends_on: ProductId) {
        self.products.insert(product);
        self.products.insert(depends_on);
        self.depends_on.entry(product).or_default().insert(depends_on);
    }

    /// Products no other product depends on — the roots of the *product*
    /// graph, which get the highest scheduling priority.
    fn roots(&self) -> Vec<ProductId> {
        let depended_on: BTreeSet<ProductId> = self.depends_on.values().flatten().copied().collect();
        self.products.iter().filter(|p| !depended_on.contains(p)).copied().collect()
    }

    /// Assigns descending integer priorities by walking the product
    /// dependency graph from its roots in DFS order: roots get the highest
    /// priority, leaves of the product graph get the lowest.
    pub fn assign_priorities(&self) -> BTreeMap<ProductId, i64> {
        let mut priorities = BTreeMap::new();
        let mut next = self.products.len() as i64;
        for root in self.roots() {
            self.visit(root, &mut next, &mut priorities);
        }
        // Any product unreachable from a root (shouldn't happen in a DAG
        // with at least one root, but a graph of disconnected single nodes
        // has every node as its own root anyway) still gets a priority.
        for product in &self.products {
            priorities.entry(*product).or_insert_with(|| {
                next -= 1;
                next
            });
        }
        priorities
    }

    fn visit(&self, product: ProductId, next: &mut i64, out: &mut BTreeMap<ProductId, i64>) {
        if out.contains_key(&product) {
            return;
        }
        *next -= 1;
        out.insert(product, *next);
        for dep in self.depends_on.get(&product).into_iter().flatten() {
            self.visit(*dep, next, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roots_outrank_leaves() {
        let mut graph = ProductGraph::new();
        let exe = ProductId(0);
        let lib = ProductId(1);
        let util = ProductId(2);
        graph.add_dependency(exe, lib);
        graph.add_dependency(lib, util);

        let priorities = graph.assign_priorities();
        assert!(priorities[&exe] > priorities[&lib]);
        assert!(priorities[&lib] > priorities[&util]);
    }

    #[test]
    fn disjoint_products_each_get_a_priority() {
        let mut graph = ProductGraph::new();
        graph.add_product(ProductId(0));
        graph.add_product(ProductId(1));
        let priorities = graph.assign_priorities();
        assert_eq!(priorities.len(), 2);
    }
}
