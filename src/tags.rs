//! Tag registry and implication closure.
//!
//! Tags are named capabilities. A tag may imply further tags and carries a
//! default [`VariableSet`]. The registry is built once from the merged
//! configuration, in topological order over the implication relation, and is
//! immutable for the rest of the run. Traversals are explicit and
//! visited-guarded so an accidental implication cycle surfaces as
//! [`TagError::TagCycle`] instead of unbounded recursion.

use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::ast::{TagDecl, to_variable_set};
use crate::vars::{VariableConflict, VariableSet};

/// A registered capability.
#[derive(Debug)]
pub struct Tag {
    /// Unique tag name.
    pub name: String,
    /// Directly implied tag names.
    pub implies: Vec<String>,
    /// Default variables contributed when this tag applies.
    pub variables: VariableSet,
}

/// Failures while building or querying the registry.
#[derive(Debug, Error)]
pub enum TagError {
    /// A name was referenced without a matching declaration.
    #[error("unknown tag '{name}'{}", referenced_by.as_ref().map(|by| format!(" (implied by '{by}')")).unwrap_or_default())]
    UnknownTag {
        /// The unregistered name.
        name: String,
        /// The tag whose `implies` list referenced it, if any.
        referenced_by: Option<String>,
    },
    /// The implication graph is not acyclic.
    #[error("tag implication cycle: {}", cycle.join(" -> "))]
    TagCycle {
        /// Tag names along the cycle, first repeated last.
        cycle: Vec<String>,
    },
    /// Duplicate declarations of a tag carry conflicting variables.
    #[error("conflicting variables for tag '{tag}'")]
    Variables {
        /// The tag with conflicting declarations.
        tag: String,
        /// The underlying conflict.
        #[source]
        source: VariableConflict,
    },
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Visiting,
    Visited,
}

/// Immutable, insertion-ordered table of tags.
#[derive(Debug, Default)]
pub struct TagRegistry {
    tags: IndexMap<String, Tag>,
}

impl TagRegistry {
    /// Build the registry from declaration order.
    ///
    /// Duplicate declarations of a name merge their variables; the
    /// implication list is taken from the first declaration only. Tags are
    /// registered implied-first so lookups during registration always
    /// succeed.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::UnknownTag`] for an implied name never declared,
    /// [`TagError::TagCycle`] when implications loop, and
    /// [`TagError::Variables`] when duplicate declarations conflict.
    pub fn from_decls(decls: &[TagDecl]) -> Result<Self, TagError> {
        let mut raw: IndexMap<String, (Vec<String>, VariableSet)> = IndexMap::new();
        for decl in decls {
            let vars = to_variable_set(&decl.variables);
            match raw.get_mut(&decl.name) {
                None => {
                    raw.insert(decl.name.clone(), (decl.implies.clone(), vars));
                }
                Some((_, existing)) => {
                    existing
                        .merge_from(&vars)
                        .map_err(|source| TagError::Variables {
                            tag: decl.name.clone(),
                            source,
                        })?;
                }
            }
        }

        let order = topological_order(&raw)?;
        let mut tags = IndexMap::new();
        for name in order {
            let (implies, variables) = raw
                .get(&name)
                .map(|(implies, vars)| (implies.clone(), vars.clone()))
                .unwrap_or_default();
            tags.insert(
                name.clone(),
                Tag {
                    name,
                    implies,
                    variables,
                },
            );
        }
        Ok(Self { tags })
    }

    /// Look up a single tag by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Tag> {
        self.tags.get(name)
    }

    /// Expand `names` into their full implication closure.
    ///
    /// Each name contributes itself first, then its implied tags depth-first.
    /// The result preserves first-seen order and holds each tag once.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::UnknownTag`] when a name is not registered.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<&Tag>, TagError> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut closure: Vec<&Tag> = Vec::new();
        for name in names {
            let mut stack: Vec<(&str, Option<&str>)> = vec![(name.as_str(), None)];
            while let Some((current, referenced_by)) = stack.pop() {
                let tag = self
                    .tags
                    .get(current)
                    .ok_or_else(|| TagError::UnknownTag {
                        name: current.to_owned(),
                        referenced_by: referenced_by.map(str::to_owned),
                    })?;
                if !seen.insert(current) {
                    continue;
                }
                closure.push(tag);
                // Reverse push keeps depth-first preorder on a LIFO stack.
                for implied in tag.implies.iter().rev() {
                    stack.push((implied.as_str(), Some(current)));
                }
            }
        }
        Ok(closure)
    }
}

/// Post-order over the implication relation: implied tags come first.
fn topological_order(
    raw: &IndexMap<String, (Vec<String>, VariableSet)>,
) -> Result<Vec<String>, TagError> {
    let mut states: HashMap<&str, VisitState> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for root in raw.keys() {
        if states.contains_key(root.as_str()) {
            continue;
        }
        let mut stack: Vec<(&str, usize)> = vec![(root.as_str(), 0)];
        states.insert(root.as_str(), VisitState::Visiting);
        while let Some(&mut (name, ref mut idx)) = stack.last_mut() {
            let implies = raw.get(name).map(|(implies, _)| implies.as_slice());
            let child = implies.and_then(|list| list.get(*idx));
            match child {
                Some(child) => {
                    *idx += 1;
                    match states.get(child.as_str()) {
                        Some(VisitState::Visited) => {}
                        Some(VisitState::Visiting) => {
                            let mut cycle: Vec<String> = stack
                                .iter()
                                .skip_while(|(n, _)| *n != child.as_str())
                                .map(|(n, _)| (*n).to_owned())
                                .collect();
                            cycle.push(child.clone());
                            return Err(TagError::TagCycle { cycle });
                        }
                        None => {
                            if !raw.contains_key(child.as_str()) {
                                return Err(TagError::UnknownTag {
                                    name: child.clone(),
                                    referenced_by: Some(name.to_owned()),
                                });
                            }
                            states.insert(child.as_str(), VisitState::Visiting);
                            stack.push((child.as_str(), 0));
                        }
                    }
                }
                None => {
                    states.insert(name, VisitState::Visited);
                    order.push(name.to_owned());
                    stack.pop();
                }
            }
        }
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn decl(name: &str, implies: &[&str]) -> TagDecl {
        TagDecl {
            name: name.to_owned(),
            implies: implies.iter().map(|s| (*s).to_owned()).collect(),
            variables: crate::ast::VarMap::new(),
        }
    }

    #[rstest]
    fn closure_includes_self_first_then_implied() {
        let registry =
            TagRegistry::from_decls(&[decl("a", &["b"]), decl("b", &[])]).expect("build");
        let resolved = registry.resolve(&["a".to_owned()]).expect("resolve");
        let names: Vec<_> = resolved.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[rstest]
    fn resolution_is_idempotent_and_deduplicated() {
        let registry = TagRegistry::from_decls(&[
            decl("a", &["b", "c"]),
            decl("b", &["c"]),
            decl("c", &[]),
        ])
        .expect("build");
        let names = |tags: Vec<&Tag>| -> Vec<String> {
            tags.iter().map(|t| t.name.clone()).collect()
        };
        let first = names(registry.resolve(&["a".to_owned()]).expect("resolve"));
        let second = names(registry.resolve(&["a".to_owned()]).expect("resolve"));
        assert_eq!(first, second);
        assert_eq!(first, ["a", "b", "c"]);

        let repeated = names(
            registry
                .resolve(&["a".to_owned(), "b".to_owned()])
                .expect("resolve"),
        );
        assert_eq!(repeated, ["a", "b", "c"]);
    }

    #[rstest]
    fn implication_cycles_are_fatal() {
        let err = TagRegistry::from_decls(&[decl("a", &["b"]), decl("b", &["a"])])
            .expect_err("cycle must fail");
        assert!(matches!(err, TagError::TagCycle { .. }), "got {err:?}");
    }

    #[rstest]
    fn unknown_implied_tag_is_reported_with_context() {
        let err = TagRegistry::from_decls(&[decl("a", &["ghost"])]).expect_err("must fail");
        match err {
            TagError::UnknownTag {
                name,
                referenced_by,
            } => {
                assert_eq!(name, "ghost");
                assert_eq!(referenced_by.as_deref(), Some("a"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[rstest]
    fn duplicate_declarations_merge_variables_keep_first_implies() {
        let mut first = decl("a", &["b"]);
        first
            .variables
            .insert("X".to_owned(), crate::ast::VarValue::Str("1".to_owned()));
        let mut second = decl("a", &["c"]);
        second
            .variables
            .insert("Y".to_owned(), crate::ast::VarValue::Str("2".to_owned()));
        let registry =
            TagRegistry::from_decls(&[first, second, decl("b", &[]), decl("c", &[])])
                .expect("build");
        let tag = registry.get("a").expect("registered");
        assert_eq!(tag.implies, ["b"]);
        assert!(tag.variables.get("X").is_some());
        assert!(tag.variables.get("Y").is_some());
    }

    #[rstest]
    fn duplicate_declarations_with_conflicting_variables_fail() {
        let mut first = decl("a", &[]);
        first
            .variables
            .insert("X".to_owned(), crate::ast::VarValue::Str("1".to_owned()));
        let mut second = decl("a", &[]);
        second
            .variables
            .insert("X".to_owned(), crate::ast::VarValue::Str("2".to_owned()));
        let err = TagRegistry::from_decls(&[first, second]).expect_err("conflict");
        assert!(matches!(err, TagError::Variables { .. }));
    }
}
