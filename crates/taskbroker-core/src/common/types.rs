//! # Shared identifiers
//!
//! Identifiers used to route work between clients, the broker and workers.
//!
//! - [`TaskType`] - A registered routing class. Workers and requests are
//!   partitioned by task type.
//! - [`TaskRegistry`] - The set of task types known to a process. Built once at
//!   startup and handed to whoever needs to resolve names; there is no
//!   process-wide registry.
//! - [`ClientId`] - Broker-assigned address of a frontend connection.
//! - [`WorkerId`] - Identity a worker announces for itself.
//! - [`CorrelationId`] - Broker-generated id tying a request to its units.

use crate::common::error::{Error, Result};
use core::{borrow::Borrow, fmt};
use std::collections::BTreeSet;
use std::sync::Arc;

/// A registered task type.
///
/// Values are only obtainable from a [`TaskRegistry`], so holding a `TaskType`
/// proves the name was registered.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskType(Arc<str>);

impl TaskType {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TaskType {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for TaskType {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// The set of task types a process accepts.
#[derive(Clone, Debug, Default)]
pub struct TaskRegistry {
    types: BTreeSet<TaskType>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name` and returns its [`TaskType`]. Registering the same
    /// name twice returns an equal value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTaskType`] if `name` is empty, since an empty
    /// task type is reserved for messages that are not task-scoped.
    pub fn register(&mut self, name: &str) -> Result<TaskType> {
        if name.is_empty() {
            return Err(Error::UnknownTaskType {
                name: String::new(),
            });
        }
        if let Some(existing) = self.types.iter().find(|t| t.as_str() == name) {
            return Ok(existing.clone());
        }
        let task_type = TaskType(Arc::from(name));
        self.types.insert(task_type.clone());
        Ok(task_type)
    }

    /// Resolves a previously registered name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTaskType`] if `name` was never registered.
    pub fn get(&self, name: &str) -> Result<TaskType> {
        self.types
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownTaskType {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains(name)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskType> {
        self.types.iter()
    }
}

impl<'a> FromIterator<&'a str> for TaskRegistry {
    /// Collects names into a registry, silently skipping empty names.
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let mut registry = Self::new();
        for name in iter {
            let _ = registry.register(name);
        }
        registry
    }
}

/// Address of a client connection on the frontend channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Identity a worker announces on the registration and dispatch channels.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(Arc<str>);

impl WorkerId {
    pub fn new(identity: impl AsRef<str>) -> Self {
        Self(Arc::from(identity.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Broker-generated identifier of a client request.
pub type CorrelationId = u64;
