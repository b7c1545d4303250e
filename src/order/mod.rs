//! Dependency ordering of the objects of one set
//!
//! Every reference from a child object to a parent object in the same set is
//! an edge `parent → child`, weighted 2 for master-detail references and 1 for
//! plain lookups. An object's weight is the sum, over its dependents, of the
//! edge weight plus the dependent's own weight. Heavier objects are written
//! first and deleted last.
//!
//! Cycles are tolerated: a dependent already on the current recursion path
//! contributes its edge weight only.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::script::ObjectSet;

const LOOKUP_WEIGHT: u64 = 1;
const MASTER_DETAIL_WEIGHT: u64 = 2;

/// Reverse reference graph of one object set
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Object names in declaration order
    names: Vec<String>,
    /// Parent → (dependent, edge weight)
    dependents: HashMap<String, Vec<(String, u64)>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph from the resolved lookups of every object in a set.
    pub fn from_object_set(set: &ObjectSet) -> Self {
        let mut graph = Self::new();
        for object in &set.objects {
            graph.add_object(object.name());
        }
        for object in &set.objects {
            for (field, parent) in object.resolved_lookups() {
                let master_detail = object.extra.master_detail_lookups.contains_key(field);
                graph.add_reference(object.name(), parent, master_detail);
            }
        }
        graph
    }

    pub fn add_object(&mut self, name: &str) {
        if !self.names.iter().any(|n| n == name) {
            self.names.push(name.to_string());
        }
    }

    /// Record that `child` references `parent`. Self-references are ignored.
    pub fn add_reference(&mut self, child: &str, parent: &str, master_detail: bool) {
        if child == parent {
            return;
        }
        let weight = if master_detail {
            MASTER_DETAIL_WEIGHT
        } else {
            LOOKUP_WEIGHT
        };
        self.dependents
            .entry(parent.to_string())
            .or_default()
            .push((child.to_string(), weight));
    }

    /// Weight of every object.
    pub fn weights(&self) -> HashMap<String, u64> {
        let mut memo = HashMap::new();
        let mut path = HashSet::new();
        for name in &self.names {
            self.weight_of(name, &mut path, &mut memo);
        }
        memo
    }

    fn weight_of(&self, name: &str, path: &mut HashSet<String>, memo: &mut HashMap<String, u64>) -> u64 {
        if let Some(weight) = memo.get(name) {
            return *weight;
        }

        path.insert(name.to_string());
        let mut weight = 0;
        if let Some(dependents) = self.dependents.get(name) {
            for (child, edge) in dependents {
                weight += edge;
                if !path.contains(child) {
                    weight += self.weight_of(child, path, memo);
                }
            }
        }
        path.remove(name);

        memo.insert(name.to_string(), weight);
        weight
    }

    /// Names sorted by descending weight, ties kept in declaration order.
    pub fn update_order(&self) -> Vec<String> {
        let weights = self.weights();
        let mut order = self.names.clone();
        order.sort_by(|a, b| weights[b].cmp(&weights[a]));
        order
    }
}

/// Compute and store the write and delete orders of a set.
pub fn apply_order(set: &mut ObjectSet) {
    let graph = DependencyGraph::from_object_set(set);
    let update_order = graph.update_order();
    let mut delete_order = update_order.clone();
    delete_order.reverse();

    debug!(
        "Object set {}: update order {:?}, delete order {:?}",
        set.index, update_order, delete_order
    );

    set.update_objects_order = update_order;
    set.delete_objects_order = delete_order;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::ScriptObject;
    use std::path::Path;

    fn graph(names: &[&str], references: &[(&str, &str, bool)]) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for name in names {
            graph.add_object(name);
        }
        for (child, parent, md) in references {
            graph.add_reference(child, parent, *md);
        }
        graph
    }

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn test_parents_before_children() {
        // Declared children-first on purpose
        let g = graph(
            &["Case", "Contact", "Account", "Opportunity", "OpportunityLineItem"],
            &[
                ("Contact", "Account", false),
                ("Case", "Contact", false),
                ("Case", "Account", false),
                ("Opportunity", "Account", false),
                ("OpportunityLineItem", "Opportunity", true),
            ],
        );
        let order = g.update_order();

        assert_eq!(order.len(), 5);
        assert!(position(&order, "Account") < position(&order, "Contact"));
        assert!(position(&order, "Contact") < position(&order, "Case"));
        assert!(position(&order, "Account") < position(&order, "Opportunity"));
        assert!(position(&order, "Opportunity") < position(&order, "OpportunityLineItem"));
    }

    #[test]
    fn test_master_detail_weighs_more() {
        let g = graph(
            &["Child", "A", "B"],
            &[("Child", "A", false), ("Child", "B", true)],
        );
        let weights = g.weights();
        assert_eq!(weights["A"], 1);
        assert_eq!(weights["B"], 2);
        assert_eq!(g.update_order(), vec!["B", "A", "Child"]);
    }

    #[test]
    fn test_cycle_produces_total_order() {
        let g = graph(
            &["A", "B", "C"],
            &[("B", "A", false), ("C", "B", false), ("A", "C", false)],
        );
        let order = g.update_order();
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(sorted, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_self_reference_ignored() {
        let g = graph(&["Account"], &[("Account", "Account", false)]);
        assert_eq!(g.weights()["Account"], 0);
    }

    #[test]
    fn test_apply_order_account_contact() {
        let mut set = ObjectSet::new(1, Path::new("/tmp"));
        let mut contact = ScriptObject::readonly_id_only("Contact", 1);
        contact
            .extra
            .lookup_objects
            .insert("AccountId".to_string(), "Account".to_string());
        set.objects.push(contact);
        set.objects.push(ScriptObject::readonly_id_only("Account", 1));

        apply_order(&mut set);
        assert_eq!(set.update_objects_order, vec!["Account", "Contact"]);
        assert_eq!(set.delete_objects_order, vec!["Contact", "Account"]);
    }
}
