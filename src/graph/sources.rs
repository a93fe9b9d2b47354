//! Source-group expansion.
//!
//! Turns the declarative source groups into leaf graph nodes. Each member is
//! expanded once per repetition tag set, with the accumulated tags of every
//! enclosing group applied first. Member paths are validated against the
//! install root before any node is created.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::ast::SourceGroup;
use crate::tags::{TagError, TagRegistry};
use crate::vars::{VariableConflict, VariableSet};

use super::{Target, TargetGraph};

/// Failures during source expansion.
#[derive(Debug, Error)]
pub enum SourceError {
    /// A declared source path does not exist under the install root.
    #[error("missing source file '{path}' (expected at '{resolved}')")]
    MissingSourceFile {
        /// The declared member path.
        path: Utf8PathBuf,
        /// The install-root location that was probed.
        resolved: Utf8PathBuf,
    },
    /// A referenced tag is not declared.
    #[error(transparent)]
    Tag(#[from] TagError),
    /// Tag variables conflicted while resolving a member.
    #[error("conflicting variables for source '{path}'")]
    Variables {
        /// The member whose variables conflicted.
        path: Utf8PathBuf,
        /// The underlying conflict.
        #[source]
        source: VariableConflict,
    },
}

/// All node types declared by `groups`, nested groups included.
#[must_use]
pub fn declared_types(groups: &[SourceGroup]) -> std::collections::HashSet<String> {
    let mut types = std::collections::HashSet::new();
    let mut stack: Vec<&SourceGroup> = groups.iter().collect();
    while let Some(group) = stack.pop() {
        types.insert(group.ty.clone());
        stack.extend(group.groups.iter());
    }
    types
}

/// Expand every group into source nodes appended to `graph`.
///
/// # Errors
///
/// Returns [`SourceError`] when a member is missing on disk, a tag is
/// unknown, or tag variables conflict.
pub fn expand(
    groups: &[SourceGroup],
    registry: &TagRegistry,
    install_root: &Utf8Path,
    graph: &mut TargetGraph,
) -> Result<(), SourceError> {
    for group in groups {
        expand_group(group, &[], registry, install_root, graph)?;
    }
    Ok(())
}

fn expand_group(
    group: &SourceGroup,
    parent_tags: &[String],
    registry: &TagRegistry,
    install_root: &Utf8Path,
    graph: &mut TargetGraph,
) -> Result<(), SourceError> {
    let mut accumulated: Vec<String> = parent_tags.to_vec();
    for tag in &group.tags {
        if !accumulated.contains(tag) {
            accumulated.push(tag.clone());
        }
    }

    // One expansion with no extra tags when no repetitions are declared.
    let no_repetitions = [Vec::new()];
    let repetitions: &[Vec<String>] = if group.repeat_for.is_empty() {
        &no_repetitions
    } else {
        &group.repeat_for
    };

    for member in &group.members {
        let resolved = install_root.join(member);
        if !resolved.as_std_path().exists() {
            return Err(SourceError::MissingSourceFile {
                path: member.clone(),
                resolved,
            });
        }
        for repetition in repetitions {
            expand_member(member, &accumulated, repetition, &group.ty, registry, graph)?;
        }
    }

    for nested in &group.groups {
        expand_group(nested, &accumulated, registry, install_root, graph)?;
    }
    Ok(())
}

fn expand_member(
    member: &Utf8Path,
    accumulated: &[String],
    repetition: &[String],
    ty: &str,
    registry: &TagRegistry,
    graph: &mut TargetGraph,
) -> Result<(), SourceError> {
    let mut names: Vec<String> = accumulated.to_vec();
    for tag in repetition {
        if !names.contains(tag) {
            names.push(tag.clone());
        }
    }
    let closure = registry.resolve(&names)?;

    let mut variables = VariableSet::new();
    for tag in &closure {
        variables
            .merge_from(&tag.variables)
            .map_err(|source| SourceError::Variables {
                path: member.to_owned(),
                source,
            })?;
    }

    let mut derived_prefix = member.with_extension("").to_string();
    if !repetition.is_empty() {
        derived_prefix.push('-');
        derived_prefix.push_str(&repetition.join("-"));
    }

    let tags: Vec<String> = closure.iter().map(|tag| tag.name.clone()).collect();
    debug!(member = %member, prefix = %derived_prefix, tags = ?tags, "expanded source");
    graph.push(Target {
        ty: ty.to_owned(),
        path: member.to_owned(),
        source_path: member.to_owned(),
        derived_prefix,
        tags,
        inputs: Vec::new(),
        variables,
        command: String::new(),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Config;
    use camino::Utf8PathBuf;
    use rstest::rstest;
    use std::fs;

    fn fixture(yaml: &str, files: &[&str]) -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().expect("tempdir");
        for file in files {
            let path = dir.path().join(file);
            fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
            fs::write(path, b"").expect("touch");
        }
        let config: Config = serde_yml::from_str(yaml).expect("parse");
        (dir, config)
    }

    fn root(dir: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 tempdir")
    }

    #[rstest]
    fn expands_members_with_closure_tags() {
        let (dir, config) = fixture(
            "tags:\n  - name: a\n    implies: [b]\n  - name: b\nsources:\n  - type: obj\n    tags: [a]\n    members: [tests/foo.c]\n",
            &["tests/foo.c"],
        );
        let registry = TagRegistry::from_decls(&config.tags).expect("registry");
        let mut graph = TargetGraph::new();
        expand(&config.sources, &registry, &root(&dir), &mut graph).expect("expand");
        assert_eq!(graph.len(), 1);
        let node = graph.get(0);
        assert_eq!(node.ty, "obj");
        assert_eq!(node.tags, ["a", "b"]);
        assert_eq!(node.derived_prefix, "tests/foo");
        assert_eq!(node.path, node.source_path);
        assert!(node.is_source());
    }

    #[rstest]
    fn repeat_for_expands_each_member_per_tag_set() {
        let (dir, config) = fixture(
            "tags:\n  - name: base\n  - name: opt\n  - name: dbg\nsources:\n  - tags: [base]\n    members: [foo.c]\n    repeat-for:\n      - [opt]\n      - [dbg]\n",
            &["foo.c"],
        );
        let registry = TagRegistry::from_decls(&config.tags).expect("registry");
        let mut graph = TargetGraph::new();
        expand(&config.sources, &registry, &root(&dir), &mut graph).expect("expand");
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.get(0).derived_prefix, "foo-opt");
        assert_eq!(graph.get(0).tags, ["base", "opt"]);
        assert_eq!(graph.get(1).derived_prefix, "foo-dbg");
        assert_eq!(graph.get(1).tags, ["base", "dbg"]);
    }

    #[rstest]
    fn nested_groups_inherit_accumulated_tags() {
        let (dir, config) = fixture(
            "tags:\n  - name: outer\n  - name: inner\nsources:\n  - tags: [outer]\n    groups:\n      - tags: [inner]\n        members: [bar.c]\n",
            &["bar.c"],
        );
        let registry = TagRegistry::from_decls(&config.tags).expect("registry");
        let mut graph = TargetGraph::new();
        expand(&config.sources, &registry, &root(&dir), &mut graph).expect("expand");
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.get(0).tags, ["outer", "inner"]);
    }

    #[rstest]
    fn missing_member_is_fatal() {
        let (dir, config) = fixture("sources:\n  - members: [ghost.c]\n", &[]);
        let registry = TagRegistry::from_decls(&[]).expect("registry");
        let mut graph = TargetGraph::new();
        let err = expand(&config.sources, &registry, &root(&dir), &mut graph)
            .expect_err("must fail");
        assert!(matches!(err, SourceError::MissingSourceFile { .. }));
    }

    #[rstest]
    fn tag_variables_merge_in_closure_order() {
        let (dir, config) = fixture(
            "tags:\n  - name: a\n    implies: [b]\n    variables:\n      FLAGS: [\"-a\"]\n  - name: b\n    variables:\n      FLAGS: [\"-b\"]\nsources:\n  - tags: [a]\n    members: [foo.c]\n",
            &["foo.c"],
        );
        let registry = TagRegistry::from_decls(&config.tags).expect("registry");
        let mut graph = TargetGraph::new();
        expand(&config.sources, &registry, &root(&dir), &mut graph).expect("expand");
        let node = graph.get(0);
        assert_eq!(
            node.variables.get("FLAGS"),
            Some(&crate::vars::Value::List(vec!["-a".into(), "-b".into()]))
        );
    }
}
