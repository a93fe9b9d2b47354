//! The target graph.
//!
//! Targets live in an arena and are addressed by their integer [`NodeId`],
//! which doubles as their identity for dependency edges, ancestry sets, and
//! visited guards. Nodes are appended during source expansion and command
//! resolution and never mutated afterwards, so the input relation is acyclic
//! by construction: a new node only references ids that already exist.

use camino::Utf8PathBuf;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::filter::{self, FilterError};
use crate::vars::VariableSet;

pub mod resolve;
pub mod sources;

/// Arena index identifying a node.
pub type NodeId = usize;

/// One unit of the build graph: a source file or a derived artifact.
#[derive(Debug, Serialize)]
pub struct Target {
    /// Node type: the declared source-group type for leaves, otherwise the
    /// producing command's type.
    #[serde(rename = "type")]
    pub ty: String,
    /// Unique output identifier.
    pub path: Utf8PathBuf,
    /// Path of the source file this node ultimately derives from.
    pub source_path: Utf8PathBuf,
    /// Base string used to name further derived nodes.
    pub derived_prefix: String,
    /// Closure-expanded tag names; order is merge-conflict priority.
    pub tags: Vec<String>,
    /// Parent nodes, in slot order. Empty for sources.
    pub inputs: Vec<NodeId>,
    /// Resolved variables, including generated private bindings.
    pub variables: VariableSet,
    /// Name of the command instance that produced this node. Empty for
    /// sources.
    pub command: String,
}

impl Target {
    /// Whether this node is a leaf source file.
    #[must_use]
    pub fn is_source(&self) -> bool {
        self.command.is_empty()
    }

    /// Boolean environment for filter evaluation: each tag name is true.
    #[must_use]
    pub fn tag_bindings(&self) -> HashMap<String, bool> {
        self.tags.iter().map(|t| (t.clone(), true)).collect()
    }
}

/// A selection failure while evaluating the run's global filter.
#[derive(Debug, Error)]
pub enum SelectionError {
    /// The global filter expression is malformed.
    #[error("global filter failed")]
    Filter(#[from] FilterError),
    /// A type allow-list pattern is malformed.
    #[error("invalid type pattern '{pattern}'")]
    Pattern {
        /// The rejected pattern text.
        pattern: String,
        /// Underlying glob failure.
        source: glob::PatternError,
    },
}

/// The current invocation's node selection: global tag filter plus an
/// optional type allow-list.
#[derive(Debug)]
pub struct Selection {
    filter: String,
    patterns: Vec<glob::Pattern>,
}

impl Selection {
    /// Compile a selection from the command line's filter and patterns.
    ///
    /// # Errors
    ///
    /// Returns [`SelectionError::Pattern`] for an invalid glob pattern.
    pub fn new(filter: impl Into<String>, patterns: &[String]) -> Result<Self, SelectionError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                glob::Pattern::new(p).map_err(|source| SelectionError::Pattern {
                    pattern: p.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            filter: filter.into(),
            patterns,
        })
    }

    /// Whether `target` is selected for this build invocation.
    ///
    /// Sources are never selected; derived nodes must satisfy the global
    /// filter and, when an allow-list was given, match at least one type
    /// pattern.
    ///
    /// # Errors
    ///
    /// Returns [`SelectionError::Filter`] when the filter expression is
    /// malformed.
    pub fn is_allowed(&self, target: &Target) -> Result<bool, SelectionError> {
        if target.is_source() {
            return Ok(false);
        }
        if !filter::evaluate(&self.filter, &target.tag_bindings())? {
            return Ok(false);
        }
        Ok(self.patterns.is_empty()
            || self.patterns.iter().any(|p| p.matches(&target.ty)))
    }
}

/// Append-only arena of targets with cached ancestry sets.
#[derive(Debug, Default)]
pub struct TargetGraph {
    nodes: Vec<Target>,
    ancestry: Vec<HashSet<NodeId>>,
}

impl TargetGraph {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node, returning its id.
    ///
    /// The ancestry set is fixed here: inputs are already present, so their
    /// own sets are final.
    pub fn push(&mut self, target: Target) -> NodeId {
        let id = self.nodes.len();
        let mut ancestry = HashSet::new();
        ancestry.insert(id);
        for &input in &target.inputs {
            if let Some(parent) = self.ancestry.get(input) {
                ancestry.extend(parent.iter().copied());
            }
        }
        self.ancestry.push(ancestry);
        self.nodes.push(target);
        id
    }

    /// Borrow a node.
    #[must_use]
    pub fn get(&self, id: NodeId) -> &Target {
        &self.nodes[id]
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph holds no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterate node ids in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        0..self.nodes.len()
    }

    /// Iterate nodes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Target)> {
        self.nodes.iter().enumerate()
    }

    /// The transitive input closure of `id`, including `id` itself.
    #[must_use]
    pub fn ancestry(&self, id: NodeId) -> &HashSet<NodeId> {
        &self.ancestry[id]
    }

    /// All nodes reachable from `id` via `inputs`, in first-visit order.
    ///
    /// With `only_allowed`, every reached node (the start node included) is
    /// gated through [`Selection::is_allowed`].
    ///
    /// # Errors
    ///
    /// Returns [`SelectionError`] when the selection filter is malformed.
    pub fn collect_dependencies(
        &self,
        id: NodeId,
        only_allowed: bool,
        selection: &Selection,
    ) -> Result<Vec<NodeId>, SelectionError> {
        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut collected = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            let node = self.get(current);
            if !only_allowed || selection.is_allowed(node)? {
                collected.push(current);
            }
            for &input in node.inputs.iter().rev() {
                stack.push(input);
            }
        }
        Ok(collected)
    }

    /// Serialisable view of the whole graph for the diagnostic dump.
    #[must_use]
    pub fn targets(&self) -> &[Target] {
        &self.nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn node(ty: &str, path: &str, inputs: Vec<NodeId>, command: &str) -> Target {
        Target {
            ty: ty.to_owned(),
            path: Utf8PathBuf::from(path),
            source_path: Utf8PathBuf::from(path),
            derived_prefix: path.to_owned(),
            tags: vec!["arch_x86".to_owned()],
            inputs,
            variables: VariableSet::new(),
            command: command.to_owned(),
        }
    }

    fn selection() -> Selection {
        Selection::new("", &[]).expect("selection")
    }

    #[rstest]
    fn ancestry_includes_self_and_transitive_inputs() {
        let mut graph = TargetGraph::new();
        let src = graph.push(node("source", "a.c", vec![], ""));
        let obj = graph.push(node("compile", "a-compile", vec![src], "compile"));
        let bin = graph.push(node("link", "a-link", vec![obj], "link"));
        assert_eq!(graph.ancestry(bin), &HashSet::from([bin, obj, src]));
        assert_eq!(graph.ancestry(src), &HashSet::from([src]));
    }

    #[rstest]
    fn collect_dependencies_stays_within_reachable_nodes() {
        let mut graph = TargetGraph::new();
        let src = graph.push(node("source", "a.c", vec![], ""));
        let other = graph.push(node("source", "b.c", vec![], ""));
        let obj = graph.push(node("compile", "a-compile", vec![src], "compile"));
        let deps = graph
            .collect_dependencies(obj, false, &selection())
            .expect("collect");
        assert_eq!(deps, vec![obj, src]);
        assert!(!deps.contains(&other));
    }

    #[rstest]
    fn collect_dependencies_gates_sources_when_only_allowed() {
        let mut graph = TargetGraph::new();
        let src = graph.push(node("source", "a.c", vec![], ""));
        let obj = graph.push(node("compile", "a-compile", vec![src], "compile"));
        let deps = graph
            .collect_dependencies(obj, true, &selection())
            .expect("collect");
        assert_eq!(deps, vec![obj]);
    }

    #[rstest]
    fn sources_are_never_allowed() {
        let mut graph = TargetGraph::new();
        let src = graph.push(node("source", "a.c", vec![], ""));
        assert!(!selection().is_allowed(graph.get(src)).expect("eval"));
    }

    #[rstest]
    fn type_allow_list_filters_by_pattern() {
        let mut graph = TargetGraph::new();
        let src = graph.push(node("source", "a.c", vec![], ""));
        let obj = graph.push(node("compile-x86", "a-compile", vec![src], "compile-x86"));
        let sel = Selection::new("", &["compile-*".to_owned()]).expect("selection");
        assert!(sel.is_allowed(graph.get(obj)).expect("eval"));
        let sel = Selection::new("", &["link".to_owned()]).expect("selection");
        assert!(!sel.is_allowed(graph.get(obj)).expect("eval"));
    }

    #[rstest]
    fn global_filter_gates_by_tags() {
        let mut graph = TargetGraph::new();
        let src = graph.push(node("source", "a.c", vec![], ""));
        let obj = graph.push(node("compile", "a-compile", vec![src], "compile"));
        let sel = Selection::new("arch_x86", &[]).expect("selection");
        assert!(sel.is_allowed(graph.get(obj)).expect("eval"));
        let sel = Selection::new("arch_arm", &[]).expect("selection");
        assert!(!sel.is_allowed(graph.get(obj)).expect("eval"));
    }
}
