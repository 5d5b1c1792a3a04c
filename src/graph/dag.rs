//! The resource dependency graph.

use super::resource::Resource;
use crate::config::ResourceConfig;
use crate::error::GraphError;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use tracing::debug;

/// A validated, acyclic graph of resources.
///
/// Nodes are stored in declaration order; edges point from a resource to
/// the resources it depends on.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    resources: Vec<Resource>,
    index: HashMap<String, usize>,
    /// `dependencies[i]`: nodes that node `i` depends on, sorted.
    dependencies: Vec<Vec<usize>>,
    /// `dependents[i]`: nodes that depend on node `i`, sorted.
    dependents: Vec<Vec<usize>>,
}

impl ResourceGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a graph from resource declarations.
    ///
    /// # Errors
    ///
    /// Returns `GraphError` on duplicate names, empty names or types,
    /// malformed or unresolved references, self references, and cycles.
    pub fn build(declarations: &[ResourceConfig]) -> Result<Self, GraphError> {
        let mut resources = Vec::with_capacity(declarations.len());
        let mut index = HashMap::with_capacity(declarations.len());

        for (i, decl) in declarations.iter().enumerate() {
            let resource = Resource::from_config(decl, i)?;
            if index.insert(resource.name.clone(), i).is_some() {
                return Err(GraphError::DuplicateResource {
                    name: resource.name,
                });
            }
            resources.push(resource);
        }

        let mut dependencies = vec![Vec::new(); resources.len()];
        let mut dependents = vec![Vec::new(); resources.len()];

        for (i, resource) in resources.iter().enumerate() {
            for dep in resource.dependencies() {
                if dep == resource.name {
                    return Err(GraphError::SelfReference {
                        resource: resource.name.clone(),
                    });
                }
                let Some(&j) = index.get(dep) else {
                    let via = if resource.explicit_dependencies.contains(dep) {
                        String::from("depends_on")
                    } else {
                        resource
                            .references
                            .iter()
                            .find(|r| r.reference.resource == dep)
                            .map_or_else(|| String::from("?"), |r| r.property.clone())
                    };
                    return Err(GraphError::UnresolvedReference {
                        resource: resource.name.clone(),
                        target: dep.to_string(),
                        via,
                    });
                };
                dependencies[i].push(j);
                dependents[j].push(i);
            }
        }

        for list in dependencies.iter_mut().chain(dependents.iter_mut()) {
            list.sort_unstable();
            list.dedup();
        }

        let graph = Self {
            resources,
            index,
            dependencies,
            dependents,
        };

        if let Some(cycle) = graph.find_cycle() {
            return Err(GraphError::Cycle { cycle });
        }

        debug!(resources = graph.len(), "Built resource graph");
        Ok(graph)
    }

    /// Number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if the graph has no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Looks up a resource by logical name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Resource> {
        self.index.get(name).map(|&i| &self.resources[i])
    }

    /// Returns true if a resource with this name is declared.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Position of a resource in the declaration list.
    #[must_use]
    pub fn declaration_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Resources in declaration order.
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.iter()
    }

    /// Names of the resources `name` depends on, in declaration order.
    #[must_use]
    pub fn dependencies_of(&self, name: &str) -> Vec<&str> {
        self.neighbours(name, &self.dependencies)
    }

    /// Names of the resources that depend on `name`, in declaration order.
    #[must_use]
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.neighbours(name, &self.dependents)
    }

    fn neighbours<'a>(&'a self, name: &str, edges: &[Vec<usize>]) -> Vec<&'a str> {
        self.index.get(name).map_or_else(Vec::new, |&i| {
            edges[i]
                .iter()
                .map(|&j| self.resources[j].name.as_str())
                .collect()
        })
    }

    /// Lazily walks the resources in topological order.
    ///
    /// Dependencies always come before dependents; ties are broken by
    /// declaration order. Each call starts a fresh walk.
    #[must_use]
    pub fn traverse(&self) -> TopoIter<'_> {
        TopoIter::new(self)
    }

    /// Groups resources into levels: every resource in level `n` depends only
    /// on resources in levels below `n`.
    #[must_use]
    pub fn levels(&self) -> Vec<Vec<&str>> {
        let mut depth = vec![0usize; self.len()];
        let mut levels: Vec<Vec<&str>> = Vec::new();

        for resource in self.traverse() {
            let i = resource.index;
            let d = self.dependencies[i]
                .iter()
                .map(|&j| depth[j] + 1)
                .max()
                .unwrap_or(0);
            depth[i] = d;
            if levels.len() <= d {
                levels.resize_with(d + 1, Vec::new);
            }
            levels[d].push(resource.name.as_str());
        }

        levels
    }

    /// Finds a cycle, returning it as `a -> b -> a`.
    fn find_cycle(&self) -> Option<String> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let n = self.len();
        let mut marks = vec![Mark::Unvisited; n];

        for start in 0..n {
            if marks[start] != Mark::Unvisited {
                continue;
            }
            // Iterative DFS over dependency edges; `path` is the current chain.
            let mut path: Vec<usize> = vec![start];
            let mut cursors: Vec<usize> = vec![0];
            marks[start] = Mark::InProgress;

            while let Some(&node) = path.last() {
                let cursor = cursors.last_mut()?;
                if let Some(&next) = self.dependencies[node].get(*cursor) {
                    *cursor += 1;
                    match marks[next] {
                        Mark::Unvisited => {
                            marks[next] = Mark::InProgress;
                            path.push(next);
                            cursors.push(0);
                        }
                        Mark::InProgress => {
                            let from = path.iter().position(|&p| p == next).unwrap_or(0);
                            let mut names: Vec<&str> = path[from..]
                                .iter()
                                .map(|&p| self.resources[p].name.as_str())
                                .collect();
                            names.push(self.resources[next].name.as_str());
                            return Some(names.join(" -> "));
                        }
                        Mark::Done => {}
                    }
                } else {
                    marks[node] = Mark::Done;
                    path.pop();
                    cursors.pop();
                }
            }
        }

        None
    }
}

/// Lazy topological iterator over a `ResourceGraph` (Kahn's algorithm).
#[derive(Debug, Clone)]
pub struct TopoIter<'a> {
    graph: &'a ResourceGraph,
    remaining: Vec<usize>,
    ready: BinaryHeap<Reverse<usize>>,
}

impl<'a> TopoIter<'a> {
    fn new(graph: &'a ResourceGraph) -> Self {
        let remaining: Vec<usize> = graph.dependencies.iter().map(Vec::len).collect();
        let ready = remaining
            .iter()
            .enumerate()
            .filter(|&(_, &d)| d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        Self {
            graph,
            remaining,
            ready,
        }
    }
}

impl<'a> Iterator for TopoIter<'a> {
    type Item = &'a Resource;

    fn next(&mut self) -> Option<Self::Item> {
        let Reverse(i) = self.ready.pop()?;
        for &dependent in &self.graph.dependents[i] {
            self.remaining[dependent] -= 1;
            if self.remaining[dependent] == 0 {
                self.ready.push(Reverse(dependent));
            }
        }
        Some(&self.graph.resources[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decl(name: &str, properties: serde_json::Value, depends_on: &[&str]) -> ResourceConfig {
        ResourceConfig {
            name: name.to_string(),
            resource_type: String::from("test.thing"),
            properties: serde_json::from_value(properties).unwrap(),
            depends_on: depends_on.iter().map(ToString::to_string).collect(),
        }
    }

    fn image_stack() -> Vec<ResourceConfig> {
        vec![
            decl("api", json!({ "name": "Image Analysis Service" }), &[]),
            decl("handler", json!({
                "role": "${role.arn}",
                "environment": { "TABLE_NAME": "${table.name}", "BUCKET_NAME": "${bucket.name}" }
            }), &[]),
            decl("table", json!({ "partition_key": "imageUrl" }), &[]),
            decl("bucket", json!({}), &[]),
            decl("role", json!({ "principal": "lambda.amazonaws.com" }), &[]),
            decl("analyze", json!({ "api": "${api.id}", "path": "analyze" }), &[]),
            decl("post", json!({ "resource": "${analyze.id}", "function": "${handler.arn}" }), &[]),
        ]
    }

    fn names(graph: &ResourceGraph) -> Vec<&str> {
        graph.traverse().map(|r| r.name.as_str()).collect()
    }

    #[test]
    fn test_topological_order_with_declaration_tie_break() {
        let graph = ResourceGraph::build(&image_stack()).unwrap();
        assert_eq!(
            names(&graph),
            vec!["api", "table", "bucket", "role", "handler", "analyze", "post"]
        );
    }

    #[test]
    fn test_traverse_is_restartable() {
        let graph = ResourceGraph::build(&image_stack()).unwrap();
        let mut first = graph.traverse();
        assert_eq!(first.next().map(|r| r.name.as_str()), Some("api"));
        assert_eq!(names(&graph).len(), 7);
        assert_eq!(first.count(), 6);
    }

    #[test]
    fn test_dependencies_and_dependents() {
        let graph = ResourceGraph::build(&image_stack()).unwrap();
        assert_eq!(graph.dependencies_of("handler"), vec!["table", "bucket", "role"]);
        assert_eq!(graph.dependents_of("handler"), vec!["post"]);
        assert!(graph.dependents_of("post").is_empty());
        assert!(graph.dependencies_of("missing").is_empty());
    }

    #[test]
    fn test_levels() {
        let graph = ResourceGraph::build(&image_stack()).unwrap();
        let levels = graph.levels();
        assert_eq!(levels[0], vec!["api", "table", "bucket", "role"]);
        assert_eq!(levels[1], vec!["handler", "analyze"]);
        assert_eq!(levels[2], vec!["post"]);
    }

    #[test]
    fn test_cycle_rejected_with_path() {
        let decls = vec![
            decl("a", json!({ "x": "${b.id}" }), &[]),
            decl("b", json!({}), &["c"]),
            decl("c", json!({ "y": "${a.id}" }), &[]),
        ];
        let err = ResourceGraph::build(&decls).unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle {
                cycle: String::from("a -> b -> c -> a")
            }
        );
    }

    #[test]
    fn test_duplicate_rejected() {
        let decls = vec![decl("a", json!({}), &[]), decl("a", json!({}), &[])];
        assert_eq!(
            ResourceGraph::build(&decls).unwrap_err(),
            GraphError::DuplicateResource {
                name: String::from("a")
            }
        );
    }

    #[test]
    fn test_unresolved_reference_rejected() {
        let decls = vec![decl("a", json!({ "role": "${role.arn}" }), &[])];
        assert_eq!(
            ResourceGraph::build(&decls).unwrap_err(),
            GraphError::UnresolvedReference {
                resource: String::from("a"),
                target: String::from("role"),
                via: String::from("role"),
            }
        );

        let decls = vec![decl("a", json!({}), &["ghost"])];
        assert!(matches!(
            ResourceGraph::build(&decls),
            Err(GraphError::UnresolvedReference { via, .. }) if via == "depends_on"
        ));
    }

    #[test]
    fn test_self_reference_rejected() {
        let decls = vec![decl("a", json!({ "me": "${a.id}" }), &[])];
        assert_eq!(
            ResourceGraph::build(&decls).unwrap_err(),
            GraphError::SelfReference {
                resource: String::from("a")
            }
        );
    }

    #[test]
    fn test_empty_graph() {
        let graph = ResourceGraph::build(&[]).unwrap();
        assert!(graph.is_empty());
        assert_eq!(graph.traverse().count(), 0);
        assert!(graph.levels().is_empty());
    }
}
