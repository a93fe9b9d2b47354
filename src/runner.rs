//! Run orchestration.
//!
//! One pass: load and merge the input documents, build the tag registry,
//! expand sources, resolve commands, then emit. Everything is generated in
//! memory first and written last, so a failing run never leaves a partial
//! build description behind.

use anyhow::{Context, Result, anyhow};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;
use thiserror::Error;
use tracing::{debug, info};

use crate::ast::Config;
use crate::cli::Cli;
use crate::graph::{Selection, TargetGraph, resolve, sources};
use crate::ninja_gen;
use crate::tags::TagRegistry;

/// Name of the emitted build description.
pub const BUILD_FILE: &str = "build.ninja";
/// Name of the diagnostic graph dump.
pub const DUMP_FILE: &str = "graph.json";

/// Failures specific to run setup.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The output directory for the build description does not exist.
    #[error("destination directory '{path}' does not exist")]
    DestinationMissing {
        /// The missing directory.
        path: Utf8PathBuf,
    },
}

/// Execute one generation run for the parsed command line.
///
/// # Errors
///
/// Any configuration, resolution, or I/O failure aborts the run; the error
/// carries the offending entity's name or path.
pub fn run(cli: &Cli) -> Result<()> {
    if !cli.destination.as_std_path().is_dir() {
        return Err(RunnerError::DestinationMissing {
            path: cli.destination.clone(),
        }
        .into());
    }

    let mut documents = Vec::with_capacity(cli.inputs.len());
    for path in &cli.inputs {
        documents.push(Config::from_path(path)?);
    }
    let config = Config::merge(documents);
    debug!(
        tags = config.tags.len(),
        sources = config.sources.len(),
        commands = config.commands.len(),
        "configuration merged"
    );

    let registry = TagRegistry::from_decls(&config.tags)?;
    let selection = Selection::new(cli.filter.clone(), &cli.types)?;
    let install_root = absolute(&cli.install_root)?;

    let mut graph = TargetGraph::new();
    sources::expand(&config.sources, &registry, &install_root, &mut graph)?;
    let leaves = graph.len();

    let instances = resolve::plan(&config.commands, &sources::declared_types(&config.sources))?;
    resolve::resolve(&mut graph, &registry, &instances, &selection, &install_root)?;
    info!(
        sources = leaves,
        derived = graph.len() - leaves,
        commands = instances.len(),
        "graph resolved"
    );

    let description = ninja_gen::generate(
        &graph,
        &instances,
        &selection,
        &config.pools,
        &install_root,
    )?;
    let dump =
        serde_json::to_string_pretty(graph.targets()).context("serialise graph dump")?;

    for instance in &instances {
        for (name, body) in &instance.decl.scripts {
            let path = cli.destination.join(name);
            fs::write(&path, body).with_context(|| format!("write script '{path}'"))?;
        }
    }
    let build_path = cli.destination.join(BUILD_FILE);
    fs::write(&build_path, description)
        .with_context(|| format!("write build description '{build_path}'"))?;
    let dump_path = cli.destination.join(DUMP_FILE);
    fs::write(&dump_path, dump).with_context(|| format!("write graph dump '{dump_path}'"))?;
    info!(build = %build_path, dump = %dump_path, "generation complete");
    Ok(())
}

/// Absolutise a path against the current directory, keeping it UTF-8.
fn absolute(path: &Utf8Path) -> Result<Utf8PathBuf> {
    let resolved = std::path::absolute(path.as_std_path())
        .with_context(|| format!("resolve install root '{path}'"))?;
    Utf8PathBuf::from_path_buf(resolved)
        .map_err(|other| anyhow!("install root '{}' is not valid UTF-8", other.display()))
}
