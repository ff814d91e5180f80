//! Case-insensitive process environment and its block format.
//!
//! A block is a sequence of `KEY=VALUE` entries, each terminated by NUL:
//!
//! ```text
//! Path=C:\Windows\0TEMP=C:\Temp\0=C:=C:\work\0
//! ```
//!
//! Entries with an empty key (`=C:=...`, `=::=::\`) are cmd.exe per-drive
//! working directory markers and are dropped.

use std::collections::BTreeMap;

use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::error::{Result, TracerError};

/// One variable, with the name as the process spelled it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct EnvVar {
    name: String,
    value: String,
}

/// Environment variables keyed case-insensitively.
///
/// Keys are normalized to uppercase at every insertion and lookup; the
/// original spelling of the name is kept for display.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, EnvVar>,
}

/// Normalized lookup key for a variable name.
pub(crate) fn normalize_key(name: &str) -> String {
    name.to_uppercase()
}

impl Environment {
    /// Create an empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a variable, returning the previous value for the same key.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let name = name.into();
        let value = value.into();
        self.vars
            .insert(normalize_key(&name), EnvVar { name, value })
            .map(|old| old.value)
    }

    /// Look up a variable by name, ignoring case.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .get(&normalize_key(name))
            .map(|var| var.value.as_str())
    }

    /// Check whether a variable is set, ignoring case.
    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(&normalize_key(name))
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Check if the environment is empty.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Iterate `(name, value)` pairs, names in their original spelling,
    /// ordered by normalized key.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars
            .values()
            .map(|var| (var.name.as_str(), var.value.as_str()))
    }

    /// Iterate `(normalized key, name, value)` triples.
    pub(crate) fn iter_normalized(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.vars
            .iter()
            .map(|(key, var)| (key.as_str(), var.name.as_str(), var.value.as_str()))
    }

    /// Value stored under an already-normalized key.
    pub(crate) fn get_normalized(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(|var| var.value.as_str())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut env = Environment::new();
        for (name, value) in iter {
            env.insert(name, value);
        }
        env
    }
}

impl Serialize for Environment {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.vars.len()))?;
        for (name, value) in self.iter() {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Split a decoded environment block into an [`Environment`].
///
/// # Errors
///
/// Returns [`TracerError::MalformedEnvironment`] if the last entry has no
/// NUL terminator or an entry has no `=`.
pub fn parse_environment_block(block: &str) -> Result<Environment> {
    let mut env = Environment::new();
    let mut rest = block;

    while !rest.is_empty() {
        let end = rest.find('\0').ok_or_else(|| {
            TracerError::MalformedEnvironment(
                "last value does not have a null terminator".to_string(),
            )
        })?;
        let entry = &rest[..end];
        rest = &rest[end + 1..];

        if entry.is_empty() {
            // trailing block terminator
            continue;
        }

        let (key, value) = entry.split_once('=').ok_or_else(|| {
            TracerError::MalformedEnvironment(format!("entry without '=': {entry:?}"))
        })?;

        if key.is_empty() {
            continue;
        }

        if env.insert(key, value).is_some() {
            tracing::debug!("Duplicate environment variable {key}, keeping the last value");
        }
    }

    Ok(env)
}

/// Build a block from `(name, value)` pairs, each entry NUL-terminated.
pub fn encode_environment_block<'a, I>(vars: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut block = String::new();
    for (name, value) in vars {
        block.push_str(name);
        block.push('=');
        block.push_str(value);
        block.push('\0');
    }
    block
}
