//! Declarative configuration structures.
//!
//! This module defines the data structures deserialised from the YAML input
//! documents: tag declarations, source groups, command definitions, and pool
//! depths. Several documents may be supplied on the command line; they are
//! merged by top-level key, with list-valued keys concatenated in argument
//! order.
//!
//! ```rust
//! use tessera::ast::Config;
//!
//! let yaml = "tags:\n  - name: arch_x86\ncommands: []\n";
//! let config: Config = serde_yml::from_str(yaml).expect("parse");
//! assert_eq!(config.tags[0].name, "arch_x86");
//! ```

use camino::Utf8PathBuf;
use indexmap::IndexMap;
use serde::Deserialize;
use std::fs;
use thiserror::Error;

use crate::vars::{Value, VariableSet};

/// A configuration document could not be read or parsed.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document file could not be read.
    #[error("cannot read configuration '{path}'")]
    Read {
        /// Path of the unreadable document.
        path: Utf8PathBuf,
        /// Underlying I/O failure.
        source: std::io::Error,
    },
    /// The document is not valid YAML for the expected schema.
    #[error("cannot parse configuration '{path}'")]
    Parse {
        /// Path of the malformed document.
        path: Utf8PathBuf,
        /// Underlying deserialisation failure.
        source: serde_yml::Error,
    },
}

/// A variable value as written in a document: scalar or sequence.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum VarValue {
    /// A single string.
    Str(String),
    /// A sequence of strings.
    List(Vec<String>),
}

/// Ordered variable block attached to a tag declaration.
pub type VarMap = IndexMap<String, VarValue>;

/// Convert a declaration's variable block into a [`VariableSet`].
///
/// Map keys are unique, so every insertion binds a fresh name.
#[must_use]
pub fn to_variable_set(vars: &VarMap) -> VariableSet {
    let mut set = VariableSet::new();
    for (name, value) in vars {
        let value = match value {
            VarValue::Str(s) => Value::Str(s.clone()),
            VarValue::List(items) => Value::List(items.clone()),
        };
        // Fresh names never conflict.
        let _ = set.set(name, value);
    }
    set
}

/// A named capability with implied tags and default variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TagDecl {
    /// Unique tag name.
    pub name: String,
    /// Tags implied by this one.
    #[serde(default)]
    pub implies: Vec<String>,
    /// Default variables contributed by this tag.
    #[serde(default)]
    pub variables: VarMap,
}

/// A group of source files sharing tags, with optional repetitions and
/// nested sub-groups.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceGroup {
    /// Node type given to the group's members. Defaults to `source`.
    #[serde(rename = "type", default = "default_source_type")]
    pub ty: String,
    /// Tags applied to every member, on top of the parent group's tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Source file paths expanded into leaf nodes.
    #[serde(default)]
    pub members: Vec<Utf8PathBuf>,
    /// Extra tag sets under which each member is expanded again.
    #[serde(default, rename = "repeat-for")]
    pub repeat_for: Vec<Vec<String>>,
    /// Nested groups inheriting this group's accumulated tags.
    #[serde(default)]
    pub groups: Vec<SourceGroup>,
}

fn default_source_type() -> String {
    "source".to_owned()
}

/// One typed, filtered input slot of a command.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Slot {
    /// Node type accepted by this slot.
    #[serde(rename = "type")]
    pub ty: String,
    /// Filter expression over candidate tags. Blank accepts everything.
    #[serde(default)]
    pub filter: String,
}

/// A typed transformation rule.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandDecl {
    /// Type name of the nodes this command produces.
    #[serde(rename = "type")]
    pub ty: String,
    /// Input slots, in order.
    pub from: Vec<Slot>,
    /// Tags stamped onto every derived node.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Shell template; `$OUTPUT` and `$INPUT`/`$INPUT1..n` are bound per edge.
    pub command: String,
    /// Suffix appended to generated output paths.
    #[serde(default)]
    pub suffix: Option<String>,
    /// Execution pool the emitted rule is assigned to.
    #[serde(default)]
    pub pool: Option<String>,
    /// Auxiliary script bodies materialised next to the build description.
    #[serde(default)]
    pub scripts: IndexMap<String, String>,
}

/// A merged view over all input documents.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Tag declarations.
    #[serde(default)]
    pub tags: Vec<TagDecl>,
    /// Source groups.
    #[serde(default)]
    pub sources: Vec<SourceGroup>,
    /// Command definitions.
    #[serde(default)]
    pub commands: Vec<CommandDecl>,
    /// Pool depths, keyed by pool name.
    #[serde(default)]
    pub pools: IndexMap<String, u32>,
}

impl Config {
    /// Read and parse one document from disk.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed.
    pub fn from_path(path: &Utf8PathBuf) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        serde_yml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })
    }

    /// Fold several documents into one, concatenating list-valued keys and
    /// key-merging pool depths (later documents win on a repeated pool name).
    #[must_use]
    pub fn merge(documents: Vec<Self>) -> Self {
        let mut merged = Self::default();
        for doc in documents {
            merged.tags.extend(doc.tags);
            merged.sources.extend(doc.sources);
            merged.commands.extend(doc.commands);
            merged.pools.extend(doc.pools);
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn parses_a_full_document() {
        let yaml = r#"
tags:
  - name: arch_x86
    implies: [compiled]
    variables:
      CFLAGS: ["-m32"]
  - name: compiled
sources:
  - type: obj
    tags: [arch_x86]
    members: [tests/foo.c]
    repeat-for:
      - [optimized]
commands:
  - type: compile
    from:
      - type: obj
        filter: arch_x86
    command: cc $INPUT -o $OUTPUT
    suffix: ".o"
    pool: build
pools:
  build: 4
"#;
        let config: Config = serde_yml::from_str(yaml).expect("parse");
        assert_eq!(config.tags.len(), 2);
        assert_eq!(config.sources[0].ty, "obj");
        assert_eq!(
            config.sources[0].repeat_for,
            vec![vec!["optimized".to_owned()]]
        );
        assert_eq!(config.commands[0].suffix.as_deref(), Some(".o"));
        assert_eq!(config.pools.get("build"), Some(&4));
    }

    #[rstest]
    fn merge_concatenates_lists_and_merges_pools() {
        let a: Config =
            serde_yml::from_str("tags: [{name: a}]\npools: {p: 1}\n").expect("parse a");
        let b: Config =
            serde_yml::from_str("tags: [{name: b}]\npools: {p: 2, q: 1}\n").expect("parse b");
        let merged = Config::merge(vec![a, b]);
        let names: Vec<_> = merged.tags.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(merged.pools.get("p"), Some(&2));
        assert_eq!(merged.pools.get("q"), Some(&1));
    }

    #[rstest]
    fn group_type_defaults_to_source() {
        let config: Config =
            serde_yml::from_str("sources: [{members: [a.c]}]\n").expect("parse");
        assert_eq!(config.sources[0].ty, "source");
    }
}
