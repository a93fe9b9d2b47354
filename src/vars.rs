//! Variable sets and their merge rules.
//!
//! Variables flow from tag declarations onto graph nodes and finally into
//! build-edge bindings. Merging is deliberately strict: a scalar may be
//! restated with the same value but never rebound, lists append in merge
//! order, and a name never changes kind. Generated bindings such as `OUTPUT`
//! are private: they apply to their own node's edge and are not propagated
//! when the set is merged into another.

use indexmap::IndexMap;
use serde::{Serialize, Serializer};
use std::collections::HashSet;
use thiserror::Error;

/// A variable value: a single string or a list of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// Scalar value, bound at most once.
    Str(String),
    /// List value, appended to on every merge.
    List(Vec<String>),
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<Vec<String>> for Value {
    fn from(value: Vec<String>) -> Self {
        Self::List(value)
    }
}

/// A merge violated the binding rules.
#[derive(Debug, Error)]
pub enum VariableConflict {
    /// A scalar was rebound to a different value.
    #[error("variable '{name}' rebound from '{previous}' to '{attempted}'")]
    Redefinition {
        /// The rebound name.
        name: String,
        /// The value already bound.
        previous: String,
        /// The rejected new value.
        attempted: String,
    },
    /// A name was used as both a scalar and a list.
    #[error("variable '{name}' mixes scalar and list values")]
    KindMismatch {
        /// The offending name.
        name: String,
    },
}

/// Insertion-ordered set of variable bindings.
#[derive(Debug, Clone, Default)]
pub struct VariableSet {
    entries: IndexMap<String, Value>,
    private: HashSet<String>,
}

impl VariableSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `value`, applying the merge rules.
    ///
    /// A fresh name is inserted. An existing scalar accepts only an identical
    /// restatement; an existing list appends the new list's items.
    ///
    /// # Errors
    ///
    /// Returns [`VariableConflict::Redefinition`] on a scalar rebind and
    /// [`VariableConflict::KindMismatch`] when the kinds differ.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<(), VariableConflict> {
        let value = value.into();
        match self.entries.get_mut(name) {
            None => {
                self.entries.insert(name.to_owned(), value);
                Ok(())
            }
            Some(Value::Str(previous)) => match value {
                Value::Str(attempted) if *previous == attempted => Ok(()),
                Value::Str(attempted) => Err(VariableConflict::Redefinition {
                    name: name.to_owned(),
                    previous: previous.clone(),
                    attempted,
                }),
                Value::List(_) => Err(VariableConflict::KindMismatch {
                    name: name.to_owned(),
                }),
            },
            Some(Value::List(existing)) => match value {
                Value::List(items) => {
                    existing.extend(items);
                    Ok(())
                }
                Value::Str(_) => Err(VariableConflict::KindMismatch {
                    name: name.to_owned(),
                }),
            },
        }
    }

    /// Bind `name` like [`set`](Self::set) and mark it private.
    ///
    /// # Errors
    ///
    /// Same rules as [`set`](Self::set).
    pub fn set_private(
        &mut self,
        name: &str,
        value: impl Into<Value>,
    ) -> Result<(), VariableConflict> {
        self.set(name, value)?;
        self.private.insert(name.to_owned());
        Ok(())
    }

    /// Merge another set's public bindings into this one.
    ///
    /// Private names in `other` are skipped.
    ///
    /// # Errors
    ///
    /// Returns the first [`VariableConflict`] hit while merging.
    pub fn merge_from(&mut self, other: &Self) -> Result<(), VariableConflict> {
        for (name, value) in &other.entries {
            if other.private.contains(name) {
                continue;
            }
            self.set(name, value.clone())?;
        }
        Ok(())
    }

    /// Look up a binding, private ones included.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(name)
    }

    /// Iterate all bindings in insertion order, private ones included.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Whether the set holds no bindings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for VariableSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(&self.entries)
    }
}
