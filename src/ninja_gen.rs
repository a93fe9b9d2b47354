//! Ninja build-description generation.
//!
//! Serialises the selected sub-graph into text consumable by Ninja: pool and
//! rule declarations, one build edge per emitted node with its full variable
//! bindings, per-node `clean-`/`run-` helpers, per-type and global phony
//! aggregates, and install edges. Iteration follows graph insertion order, so
//! identical input yields a byte-identical description.

use camino::Utf8Path;
use indexmap::IndexMap;
use itertools::Itertools;
use std::collections::HashMap;
use std::fmt::Write;

use crate::graph::resolve::{CommandInstance, UNAVAILABLE};
use crate::graph::{NodeId, Selection, SelectionError, Target, TargetGraph};
use crate::vars::Value;

/// Pool serialising `run-` helpers; recursive Ninja invocations share
/// on-disk fixtures and must not overlap.
const RUN_POOL: &str = "serialize_run";

macro_rules! w {
    ($out:expr, $($arg:tt)*) => {
        writeln!($out, $($arg)*).expect("write build description")
    };
}

/// One node that passed selection with every input resolved.
struct Emitted<'a> {
    id: NodeId,
    node: &'a Target,
    inputs: Vec<String>,
}

/// Generate the build description for the selected sub-graph.
///
/// # Errors
///
/// Returns [`SelectionError`] when the run's filter expression is malformed.
pub fn generate(
    graph: &TargetGraph,
    instances: &[CommandInstance],
    selection: &Selection,
    pools: &IndexMap<String, u32>,
    install_root: &Utf8Path,
) -> Result<String, SelectionError> {
    let mut out = String::new();
    emit_pools(&mut out, instances, pools);
    emit_rules(&mut out, instances);

    let emitted = collect_emitted(graph, selection)?;
    for entry in &emitted {
        emit_edge(&mut out, entry);
        emit_helpers(&mut out, graph, entry, selection)?;
    }

    emit_aggregates(&mut out, instances, &emitted, install_root);
    Ok(out)
}

/// Selected nodes whose `INPUT*` bindings are all resolved.
fn collect_emitted<'a>(
    graph: &'a TargetGraph,
    selection: &Selection,
) -> Result<Vec<Emitted<'a>>, SelectionError> {
    let mut emitted = Vec::new();
    for (id, node) in graph.iter() {
        if !selection.is_allowed(node)? {
            continue;
        }
        if let Some(inputs) = resolved_inputs(node) {
            emitted.push(Emitted { id, node, inputs });
        }
    }
    Ok(emitted)
}

/// The edge's explicit input paths, or `None` when any is unavailable.
fn resolved_inputs(node: &Target) -> Option<Vec<String>> {
    let names: Vec<String> = if node.inputs.len() == 1 {
        vec!["INPUT".to_owned()]
    } else {
        (1..=node.inputs.len()).map(|i| format!("INPUT{i}")).collect()
    };
    let mut inputs = Vec::with_capacity(names.len());
    for name in names {
        match node.variables.get(&name) {
            Some(Value::Str(path)) if path != UNAVAILABLE => inputs.push(path.clone()),
            _ => return None,
        }
    }
    Some(inputs)
}

fn emit_pools(out: &mut String, instances: &[CommandInstance], pools: &IndexMap<String, u32>) {
    w!(out, "pool {RUN_POOL}");
    w!(out, "  depth = 1");
    w!(out, "");
    let mut declared: Vec<&str> = vec![RUN_POOL];
    for (name, depth) in pools {
        if declared.contains(&name.as_str()) {
            continue;
        }
        declared.push(name.as_str());
        w!(out, "pool {name}");
        w!(out, "  depth = {depth}");
        w!(out, "");
    }
    // Pools referenced by commands but never declared default to depth 1.
    for instance in instances {
        let Some(pool) = &instance.decl.pool else {
            continue;
        };
        if declared.contains(&pool.as_str()) {
            continue;
        }
        declared.push(pool.as_str());
        w!(out, "pool {pool}");
        w!(out, "  depth = 1");
        w!(out, "");
    }
}

fn emit_rules(out: &mut String, instances: &[CommandInstance]) {
    for instance in instances {
        w!(out, "rule {}", instance.name);
        w!(out, "  command = {}", instance.decl.command);
        w!(out, "  description = {} $OUTPUT", instance.name);
        if let Some(pool) = &instance.decl.pool {
            w!(out, "  pool = {pool}");
        }
        w!(out, "");
    }
    w!(out, "rule clean");
    w!(out, "  command = rm -f $TARGETS");
    w!(out, "  description = clean $TARGETS");
    w!(out, "");
    w!(out, "rule run");
    w!(out, "  command = ninja $CLEAN && ninja $TARGET");
    w!(out, "  description = rerun $TARGET");
    w!(out, "  pool = {RUN_POOL}");
    w!(out, "");
    w!(out, "rule install");
    w!(out, "  command = mkdir -p $$(dirname $out) && cp $in $out");
    w!(out, "  description = install $out");
    w!(out, "");
}

fn emit_edge(out: &mut String, entry: &Emitted<'_>) {
    w!(
        out,
        "build {}: {} {}",
        entry.node.path,
        entry.node.command,
        entry.inputs.iter().join(" ")
    );
    for (name, value) in entry.node.variables.iter() {
        w!(out, "  {name} = {}", render(value));
    }
    w!(out, "");
}

fn emit_helpers(
    out: &mut String,
    graph: &TargetGraph,
    entry: &Emitted<'_>,
    selection: &Selection,
) -> Result<(), SelectionError> {
    let removal = graph
        .collect_dependencies(entry.id, true, selection)?
        .into_iter()
        .map(|dep| graph.get(dep).path.as_str())
        .join(" ");
    let path = &entry.node.path;
    w!(out, "build clean-{path}: clean");
    w!(out, "  TARGETS = {removal}");
    w!(out, "");
    w!(out, "build run-{path}: run");
    w!(out, "  CLEAN = clean-{path}");
    w!(out, "  TARGET = {path}");
    w!(out, "");
    Ok(())
}

fn emit_aggregates(
    out: &mut String,
    instances: &[CommandInstance],
    emitted: &[Emitted<'_>],
    install_root: &Utf8Path,
) {
    let mut by_type: IndexMap<&str, Vec<&str>> = IndexMap::new();
    for entry in emitted {
        by_type
            .entry(entry.node.ty.as_str())
            .or_default()
            .push(entry.node.path.as_str());
    }
    for (ty, outputs) in &by_type {
        w!(out, "build {ty}: phony {}", outputs.iter().join(" "));
        w!(
            out,
            "build clean-{ty}: phony {}",
            outputs.iter().map(|path| format!("clean-{path}")).join(" ")
        );
        w!(
            out,
            "build run-{ty}: phony {}",
            outputs.iter().map(|path| format!("run-{path}")).join(" ")
        );
        w!(out, "");
    }

    let outputs: Vec<&str> = emitted
        .iter()
        .map(|entry| entry.node.path.as_str())
        .collect();
    w!(out, "build all: phony {}", outputs.iter().join(" "));
    w!(out, "");

    // Only rules that actually produce an artifact are installed; a rule
    // whose template never mentions $OUTPUT only consumes or validates.
    let producing: HashMap<&str, bool> = instances
        .iter()
        .map(|instance| {
            (
                instance.name.as_str(),
                instance.decl.command.contains("$OUTPUT"),
            )
        })
        .collect();
    let mut installed = Vec::new();
    for entry in emitted {
        if !producing
            .get(entry.node.command.as_str())
            .copied()
            .unwrap_or(false)
        {
            continue;
        }
        let dest = install_root.join(&entry.node.path);
        w!(out, "build {dest}: install {}", entry.node.path);
        installed.push(dest);
    }
    if !installed.is_empty() {
        w!(out, "");
    }
    w!(out, "build install: phony {}", installed.iter().join(" "));
    w!(out, "");

    w!(out, "build clean: clean");
    w!(out, "  TARGETS = {}", outputs.iter().join(" "));
    w!(out, "build clean-all: clean");
    w!(
        out,
        "  TARGETS = {}",
        outputs
            .iter()
            .map(ToString::to_string)
            .chain(installed.iter().map(ToString::to_string))
            .join(" ")
    );
    w!(out, "");

    w!(
        out,
        "build run-all: phony {}",
        outputs.iter().map(|path| format!("run-{path}")).join(" ")
    );
    w!(out, "default run-all");
}

fn render(value: &Value) -> String {
    match value {
        Value::Str(s) => s.clone(),
        Value::List(items) => items.iter().join(" "),
    }
}
