//! Command resolution.
//!
//! Commands are processed in dependency order over their declared input
//! types: whatever produces a type runs before whatever consumes it. For
//! each command the resolver collects per-slot candidate nodes, enumerates
//! candidate tuples, keeps the maximally related ones (largest shared
//! ancestry), and materialises one derived node per accepted tuple.
//!
//! Relatedness keeps a multi-input command from cross-producing unrelated
//! lineages: an object file links against the library variant descended from
//! the same original source. Equally related tuples are all kept; later
//! filtering decides, never this pass.

use camino::{Utf8Path, Utf8PathBuf};
use itertools::Itertools;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::debug;

use crate::ast::CommandDecl;
use crate::filter::{self, FilterError};
use crate::tags::{TagError, TagRegistry};
use crate::vars::{VariableConflict, VariableSet};

use super::{NodeId, Selection, SelectionError, Target, TargetGraph};

/// Sentinel bound to an `INPUT*` variable when the input is neither selected
/// nor present under the install root.
pub const UNAVAILABLE: &str = "UNAVAILABLE";

/// A command definition with its assigned unique rule name.
#[derive(Debug)]
pub struct CommandInstance {
    /// Unique rule name: the type, index-suffixed for repeats.
    pub name: String,
    /// The underlying declaration.
    pub decl: CommandDecl,
}

/// Failures during command planning and resolution.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// A slot references a type no source group or command produces.
    #[error("command '{command}' consumes unknown input type '{input_type}'")]
    UnknownInputType {
        /// The consuming command's name.
        command: String,
        /// The unproduced type.
        input_type: String,
    },
    /// The consumes/produces relation between commands is cyclic.
    #[error("command dependency cycle involving: {}", cycle.join(", "))]
    CommandCycle {
        /// Names of the commands that could not be ordered.
        cycle: Vec<String>,
    },
    /// Two command instances resolved to the same name.
    #[error("duplicate command name '{name}'")]
    DuplicateCommandName {
        /// The colliding name.
        name: String,
    },
    /// A slot filter expression is malformed.
    #[error("command '{command}' has an invalid filter")]
    Filter {
        /// The command owning the filter.
        command: String,
        /// The underlying parse failure.
        #[source]
        source: FilterError,
    },
    /// Variables conflicted while deriving a node.
    #[error("conflicting variables while deriving '{path}'")]
    Variables {
        /// The derived node's output path.
        path: String,
        /// The underlying conflict.
        #[source]
        source: VariableConflict,
    },
    /// A tag referenced by a command is not declared.
    #[error(transparent)]
    Tag(#[from] TagError),
    /// The run's selection could not be evaluated.
    #[error(transparent)]
    Selection(#[from] SelectionError),
}

/// Assign unique names and order instances so producers precede consumers.
///
/// `source_types` lists the types produced by source groups; together with
/// the command types they form the set of known input types.
///
/// # Errors
///
/// Returns [`ResolveError::UnknownInputType`] for a slot type nobody
/// produces, [`ResolveError::DuplicateCommandName`] on a name collision, and
/// [`ResolveError::CommandCycle`] when the type relation cannot be ordered.
pub fn plan(
    decls: &[CommandDecl],
    source_types: &HashSet<String>,
) -> Result<Vec<CommandInstance>, ResolveError> {
    let instances = assign_names(decls)?;

    let command_types: HashSet<&str> = instances
        .iter()
        .map(|instance| instance.decl.ty.as_str())
        .collect();
    for instance in &instances {
        for slot in &instance.decl.from {
            if !source_types.contains(&slot.ty) && !command_types.contains(slot.ty.as_str()) {
                return Err(ResolveError::UnknownInputType {
                    command: instance.name.clone(),
                    input_type: slot.ty.clone(),
                });
            }
        }
    }

    topological_order(instances)
}

fn assign_names(decls: &[CommandDecl]) -> Result<Vec<CommandInstance>, ResolveError> {
    let mut occurrences: HashMap<&str, usize> = HashMap::new();
    let mut taken: HashSet<String> = HashSet::new();
    let mut instances = Vec::with_capacity(decls.len());
    for decl in decls {
        let count = occurrences.entry(decl.ty.as_str()).or_insert(0);
        *count += 1;
        let name = if *count == 1 {
            decl.ty.clone()
        } else {
            format!("{}-{count}", decl.ty)
        };
        if !taken.insert(name.clone()) {
            return Err(ResolveError::DuplicateCommandName { name });
        }
        instances.push(CommandInstance {
            name,
            decl: decl.clone(),
        });
    }
    Ok(instances)
}

/// Stable Kahn ordering: among ready commands, declaration order wins.
fn topological_order(
    instances: Vec<CommandInstance>,
) -> Result<Vec<CommandInstance>, ResolveError> {
    let mut producers_left: HashMap<String, usize> = HashMap::new();
    for instance in &instances {
        *producers_left.entry(instance.decl.ty.clone()).or_insert(0) += 1;
    }

    let mut remaining: Vec<Option<CommandInstance>> = instances.into_iter().map(Some).collect();
    let mut ordered = Vec::with_capacity(remaining.len());
    let mut left = remaining.len();
    while left > 0 {
        let ready = remaining.iter().position(|slot| {
            slot.as_ref().is_some_and(|instance| {
                instance.decl.from.iter().all(|slot| {
                    producers_left.get(&slot.ty).copied().unwrap_or(0) == 0
                })
            })
        });
        match ready {
            Some(index) => {
                let instance = remaining[index].take().unwrap_or_else(|| unreachable!());
                if let Some(count) = producers_left.get_mut(&instance.decl.ty) {
                    *count -= 1;
                }
                ordered.push(instance);
                left -= 1;
            }
            None => {
                let cycle: Vec<String> = remaining
                    .iter()
                    .flatten()
                    .map(|instance| instance.name.clone())
                    .collect();
                return Err(ResolveError::CommandCycle { cycle });
            }
        }
    }
    Ok(ordered)
}

/// Resolve every command against the growing graph, appending derived nodes.
///
/// `install_root` must be absolute; it anchors the `SOURCE`/`SOURCES_ROOT`
/// bindings and the on-disk fallback for unselected inputs.
///
/// # Errors
///
/// Returns [`ResolveError`] on malformed filters, variable conflicts, or
/// unknown tags.
pub fn resolve(
    graph: &mut TargetGraph,
    registry: &TagRegistry,
    instances: &[CommandInstance],
    selection: &Selection,
    install_root: &Utf8Path,
) -> Result<(), ResolveError> {
    for instance in instances {
        if instance.decl.from.is_empty() {
            debug!(command = %instance.name, "command declares no input slots");
            continue;
        }
        let Some(candidates) = slot_candidates(graph, instance)? else {
            debug!(command = %instance.name, "no applicable inputs");
            continue;
        };
        let tuples = select_tuples(graph, &candidates);
        debug!(
            command = %instance.name,
            tuples = tuples.len(),
            "resolved candidate tuples"
        );
        for tuple in tuples {
            let target = derive(graph, registry, instance, &tuple, selection, install_root)?;
            graph.push(target);
        }
    }
    Ok(())
}

/// Collect per-slot candidate ids; `None` when any slot is empty.
fn slot_candidates(
    graph: &TargetGraph,
    instance: &CommandInstance,
) -> Result<Option<Vec<Vec<NodeId>>>, ResolveError> {
    let mut candidates = Vec::with_capacity(instance.decl.from.len());
    for slot in &instance.decl.from {
        let mut matching = Vec::new();
        for (id, node) in graph.iter() {
            if node.ty != slot.ty {
                continue;
            }
            let accepted = filter::evaluate(&slot.filter, &node.tag_bindings()).map_err(
                |source| ResolveError::Filter {
                    command: instance.name.clone(),
                    source,
                },
            )?;
            if accepted {
                matching.push(id);
            }
        }
        if matching.is_empty() {
            return Ok(None);
        }
        candidates.push(matching);
    }
    Ok(Some(candidates))
}

/// Enumerate duplicate-free tuples and keep those with maximal shared
/// ancestry. Single-slot commands skip similarity scoring entirely.
fn select_tuples(graph: &TargetGraph, candidates: &[Vec<NodeId>]) -> Vec<Vec<NodeId>> {
    if let [only] = candidates {
        return only.iter().map(|&id| vec![id]).collect();
    }

    let mut scored: Vec<(usize, Vec<NodeId>)> = Vec::new();
    for tuple in candidates
        .iter()
        .map(|slot| slot.iter().copied())
        .multi_cartesian_product()
    {
        let distinct: HashSet<NodeId> = tuple.iter().copied().collect();
        if distinct.len() != tuple.len() {
            continue;
        }
        scored.push((similarity(graph, &tuple), tuple));
    }

    let best = scored.iter().map(|(score, _)| *score).max();
    let Some(best) = best else {
        return Vec::new();
    };
    scored
        .into_iter()
        .filter(|(score, _)| *score == best)
        .map(|(_, tuple)| tuple)
        .collect()
}

/// Size of the intersection of the tuple members' ancestry sets.
fn similarity(graph: &TargetGraph, tuple: &[NodeId]) -> usize {
    let Some((&first, rest)) = tuple.split_first() else {
        return 0;
    };
    graph
        .ancestry(first)
        .iter()
        .filter(|&&ancestor| rest.iter().all(|&id| graph.ancestry(id).contains(&ancestor)))
        .count()
}

fn derive(
    graph: &TargetGraph,
    registry: &TagRegistry,
    instance: &CommandInstance,
    tuple: &[NodeId],
    selection: &Selection,
    install_root: &Utf8Path,
) -> Result<Target, ResolveError> {
    let decl = &instance.decl;
    let first = graph.get(tuple[0]);
    let derived_prefix = first.derived_prefix.clone();
    let source_path = first.source_path.clone();

    // Output tags first, then every input's tags in tuple order. Duplicates
    // stay: the list order is merge priority, the guard below keeps each
    // tag's variables from applying twice.
    let mut tags: Vec<String> = registry
        .resolve(&decl.tags)?
        .iter()
        .map(|tag| tag.name.clone())
        .collect();
    for &id in tuple {
        tags.extend(graph.get(id).tags.iter().cloned());
    }

    let path = derived_path(graph, decl, &derived_prefix, tuple);

    let mut variables = VariableSet::new();
    let mut applied: HashSet<String> = HashSet::new();
    let conflict = |source| ResolveError::Variables {
        path: path.clone(),
        source,
    };
    for &id in tuple {
        for name in &graph.get(id).tags {
            merge_tag_once(&mut variables, &mut applied, registry, name)
                .map_err(conflict)?;
        }
    }
    for name in &tags {
        merge_tag_once(&mut variables, &mut applied, registry, name).map_err(conflict)?;
    }

    variables.set_private("OUTPUT", path.as_str()).map_err(conflict)?;
    let resolved: Vec<String> = tuple
        .iter()
        .map(|&id| resolved_input_path(graph, selection, install_root, id))
        .collect::<Result<_, _>>()?;
    if let [sole] = resolved.as_slice() {
        variables.set_private("INPUT", sole.as_str()).map_err(conflict)?;
    } else {
        for (index, input) in resolved.iter().enumerate() {
            variables
                .set_private(&format!("INPUT{}", index + 1), input.as_str())
                .map_err(conflict)?;
        }
    }
    variables
        .set_private("SOURCE", install_root.join(&source_path).as_str())
        .map_err(conflict)?;
    variables
        .set_private("SOURCES_ROOT", install_root.as_str())
        .map_err(conflict)?;

    Ok(Target {
        ty: decl.ty.clone(),
        path: Utf8PathBuf::from(path),
        source_path,
        derived_prefix,
        tags,
        inputs: tuple.to_vec(),
        variables,
        command: instance.name.clone(),
    })
}

/// `<prefix>-<type>[-<8-hex hash of the other inputs' paths>][<suffix>]`.
fn derived_path(
    graph: &TargetGraph,
    decl: &CommandDecl,
    derived_prefix: &str,
    tuple: &[NodeId],
) -> String {
    let mut path = format!("{derived_prefix}-{}", decl.ty);
    if tuple.len() > 1 {
        let mut hasher = Sha256::new();
        for &id in &tuple[1..] {
            hasher.update(graph.get(id).path.as_str().as_bytes());
        }
        let digest = format!("{:x}", hasher.finalize());
        path.push('-');
        path.push_str(&digest[..8]);
    }
    if let Some(suffix) = &decl.suffix {
        path.push_str(suffix);
    }
    path
}

fn merge_tag_once(
    variables: &mut VariableSet,
    applied: &mut HashSet<String>,
    registry: &TagRegistry,
    name: &str,
) -> Result<(), VariableConflict> {
    if !applied.insert(name.to_owned()) {
        return Ok(());
    }
    if let Some(tag) = registry.get(name) {
        variables.merge_from(&tag.variables)?;
    }
    Ok(())
}

/// A tuple element's concrete path for `INPUT*` bindings.
///
/// Selected nodes use their graph path; unselected ones fall back to an
/// already-installed artifact, else the [`UNAVAILABLE`] sentinel.
fn resolved_input_path(
    graph: &TargetGraph,
    selection: &Selection,
    install_root: &Utf8Path,
    id: NodeId,
) -> Result<String, SelectionError> {
    let node = graph.get(id);
    if selection.is_allowed(node)? {
        return Ok(node.path.to_string());
    }
    let installed = install_root.join(&node.path);
    if installed.as_std_path().exists() {
        Ok(installed.to_string())
    } else {
        Ok(UNAVAILABLE.to_owned())
    }
}
