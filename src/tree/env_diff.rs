//! Environment changes between a process and its parent.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::codec::{normalize_key, Environment};

/// What happened to one variable relative to the parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "change", rename_all = "camelCase")]
pub enum EnvChange {
    /// Set in the parent, missing in the child.
    Removed { old: String },
    /// Added (`old` is `None`) or changed to `new`.
    Set { old: Option<String>, new: String },
}

impl EnvChange {
    /// The child's value, `None` if the variable was removed.
    pub fn new_value(&self) -> Option<&str> {
        match self {
            EnvChange::Removed { .. } => None,
            EnvChange::Set { new, .. } => Some(new),
        }
    }

    /// The parent's value, `None` if the variable was added.
    pub fn old_value(&self) -> Option<&str> {
        match self {
            EnvChange::Removed { old } => Some(old),
            EnvChange::Set { old, .. } => old.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DiffEntry {
    name: String,
    change: EnvChange,
}

/// Case-insensitive map from variable name to [`EnvChange`].
///
/// Computed once when a process is recorded and never modified.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentDiff {
    entries: BTreeMap<String, DiffEntry>,
}

impl EnvironmentDiff {
    /// Diff `child` against `parent`.
    ///
    /// Variables with equal values on both sides do not appear. Value
    /// comparison is case-sensitive, only names are not.
    pub fn compute(parent: &Environment, child: &Environment) -> Self {
        let mut entries = BTreeMap::new();

        for (key, name, old) in parent.iter_normalized() {
            if child.get_normalized(key).is_none() {
                entries.insert(
                    key.to_string(),
                    DiffEntry {
                        name: name.to_string(),
                        change: EnvChange::Removed {
                            old: old.to_string(),
                        },
                    },
                );
            }
        }

        for (key, name, new) in child.iter_normalized() {
            let old = parent.get_normalized(key);
            if old != Some(new) {
                entries.insert(
                    key.to_string(),
                    DiffEntry {
                        name: name.to_string(),
                        change: EnvChange::Set {
                            old: old.map(str::to_string),
                            new: new.to_string(),
                        },
                    },
                );
            }
        }

        Self { entries }
    }

    /// Change recorded for a variable, ignoring case.
    pub fn get(&self, name: &str) -> Option<&EnvChange> {
        self.entries
            .get(&normalize_key(name))
            .map(|entry| &entry.change)
    }

    /// Number of changed variables.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate `(name, change)`; removed variables use the parent's spelling.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &EnvChange)> {
        self.entries
            .values()
            .map(|entry| (entry.name.as_str(), &entry.change))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Environment {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_added_and_changed() {
        let parent = env(&[("A", "1"), ("B", "2")]);
        let child = env(&[("A", "1"), ("B", "3"), ("C", "4")]);
        let diff = EnvironmentDiff::compute(&parent, &child);

        assert_eq!(diff.len(), 2);
        assert!(diff.get("A").is_none());
        assert_eq!(
            diff.get("B"),
            Some(&EnvChange::Set {
                old: Some("2".to_string()),
                new: "3".to_string()
            })
        );
        assert_eq!(diff.get("C").and_then(EnvChange::new_value), Some("4"));
        assert_eq!(diff.get("C").and_then(EnvChange::old_value), None);
    }

    #[test]
    fn test_removed() {
        let diff = EnvironmentDiff::compute(&env(&[("X", "1")]), &Environment::new());
        assert_eq!(
            diff.get("x"),
            Some(&EnvChange::Removed {
                old: "1".to_string()
            })
        );
    }

    #[test]
    fn test_names_compare_case_insensitively() {
        let parent = env(&[("Path", "C:\\bin")]);
        let child = env(&[("PATH", "C:\\bin")]);
        assert!(EnvironmentDiff::compute(&parent, &child).is_empty());

        let child = env(&[("PATH", "c:\\bin")]);
        let diff = EnvironmentDiff::compute(&parent, &child);
        assert_eq!(diff.iter().next().map(|(name, _)| name), Some("PATH"));
    }

    #[test]
    fn test_empty_value_is_a_change() {
        let diff = EnvironmentDiff::compute(&env(&[("A", "1")]), &env(&[("A", "")]));
        assert_eq!(diff.get("A").and_then(EnvChange::new_value), Some(""));
    }
}
