//! In-memory cache of window and process identities.
//!
//! The first time a descriptor is seen it is looked up in the store and
//! inserted if missing; after that the numeric id is served from memory for
//! the rest of the run. Entries are never evicted or invalidated.

use crate::collector::types::{Process, Window};
use crate::core::sanitize::sanitize;
use crate::store::{IdentityStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Identity cached when a lookup fails under [`LookupPolicy::Placeholder`].
pub const PLACEHOLDER_ID: i64 = 0;

/// What to do when the store fails for a reason other than "not found".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupPolicy {
    /// Surface the error to the caller
    #[default]
    FailFast,
    /// Cache [`PLACEHOLDER_ID`] for the descriptor and carry on
    Placeholder,
}

#[derive(Debug, Error)]
#[error("failed to resolve identity of {descriptor}: {source}")]
pub struct IdentityError {
    pub descriptor: String,
    #[source]
    pub source: StoreError,
}

#[derive(Debug, Default)]
pub struct IdentityCache {
    policy: LookupPolicy,
    processes: HashMap<Process, i64>,
    windows: HashMap<Window, i64>,
}

impl IdentityCache {
    pub fn new(policy: LookupPolicy) -> Self {
        Self {
            policy,
            processes: HashMap::new(),
            windows: HashMap::new(),
        }
    }

    /// Resolve a process to its persisted id, inserting it on first sight.
    pub fn resolve_process<S>(&mut self, store: &mut S, process: &Process) -> Result<i64, IdentityError>
    where
        S: IdentityStore + ?Sized,
    {
        if let Some(&id) = self.processes.get(process) {
            return Ok(id);
        }

        let name = sanitize(&process.name);
        let cmdline = sanitize(&process.cmdline);
        let result = store
            .find_process(&name, &cmdline)
            .and_then(|found| match found {
                Some(id) => Ok(id),
                None => store.insert_process(&name, &cmdline),
            });

        let id = self.settle(result, || format!("process {name:?}"))?;
        self.processes.insert(process.clone(), id);
        Ok(id)
    }

    /// Resolve a window to its persisted id. The owning process is resolved
    /// first since the window row references it.
    pub fn resolve_window<S>(&mut self, store: &mut S, window: &Window) -> Result<i64, IdentityError>
    where
        S: IdentityStore + ?Sized,
    {
        if let Some(&id) = self.windows.get(window) {
            return Ok(id);
        }

        let process_id = self.resolve_process(store, &window.process)?;
        let title = sanitize(&window.title);
        let class = sanitize(&window.class);
        let result = store
            .find_window(&title, &class, process_id)
            .and_then(|found| match found {
                Some(id) => Ok(id),
                None => store.insert_window(&title, &class, process_id),
            });

        let id = self.settle(result, || format!("window {class:?} {title:?}"))?;
        self.windows.insert(window.clone(), id);
        Ok(id)
    }

    /// Cached id for a window, without touching the store.
    pub fn cached_window(&self, window: &Window) -> Option<i64> {
        self.windows.get(window).copied()
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    fn settle(
        &self,
        result: Result<i64, StoreError>,
        descriptor: impl FnOnce() -> String,
    ) -> Result<i64, IdentityError> {
        match (result, self.policy) {
            (Ok(id), _) => Ok(id),
            (Err(source), LookupPolicy::FailFast) => Err(IdentityError {
                descriptor: descriptor(),
                source,
            }),
            (Err(source), LookupPolicy::Placeholder) => {
                tracing::warn!(
                    "identity lookup for {} failed, using placeholder id: {source}",
                    descriptor()
                );
                Ok(PLACEHOLDER_ID)
            }
        }
    }
}
