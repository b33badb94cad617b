//! Process-wide ignore list.
//!
//! Readers take an immutable snapshot; a reload builds a complete new list and
//! swaps it in one step. A failed reload leaves the active snapshot untouched.

use crate::config::Config;
use crate::error::{KnownSendersError, Result};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreList {
    ods: HashSet<String>,
}

impl IgnoreList {
    /// Build a list from configured entries. Empty or whitespace-bearing entries are rejected.
    pub fn new<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ods = HashSet::new();
        for entry in entries {
            let entry = entry.into();
            if entry.is_empty() || entry.chars().any(char::is_whitespace) {
                return Err(KnownSendersError::ConfigurationReloadFailure(format!(
                    "invalid ignored OD {entry:?}"
                )));
            }
            ods.insert(entry);
        }
        Ok(IgnoreList { ods })
    }

    /// Exact string membership. No case or whitespace normalization is applied.
    pub fn contains(&self, od: &str) -> bool {
        self.ods.contains(od)
    }

    pub fn len(&self) -> usize {
        self.ods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ods.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct IgnoreListHandle {
    current: RwLock<Arc<IgnoreList>>,
}

impl IgnoreListHandle {
    pub fn new(list: IgnoreList) -> Self {
        IgnoreListHandle {
            current: RwLock::new(Arc::new(list)),
        }
    }

    pub fn snapshot(&self) -> Arc<IgnoreList> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn replace(&self, list: IgnoreList) {
        let list = Arc::new(list);
        match self.current.write() {
            Ok(mut guard) => *guard = list,
            Err(poisoned) => *poisoned.into_inner() = list,
        }
    }

    /// Re-read the `ignored_ods` section from a configuration file.
    ///
    /// Returns the size of the new list. On failure the previous snapshot stays active.
    pub fn reload_from_file(&self, path: &str) -> Result<usize> {
        let config = Config::from_file(path)
            .map_err(|e| KnownSendersError::ConfigurationReloadFailure(format!("{e:#}")))?;
        self.reload(&config)
    }

    pub fn reload(&self, config: &Config) -> Result<usize> {
        let list = IgnoreList::new(config.ignored_ods.iter().cloned())?;
        let size = list.len();
        self.replace(list);
        log::info!("ignore list reloaded: {size} organizational domains");
        Ok(size)
    }
}
