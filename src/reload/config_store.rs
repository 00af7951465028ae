//! The live rule set and its reload path.

use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::ratelimit::RuleSet;

/// Holds the currently published `RuleSet` for a rules file.
///
/// Readers take a snapshot with [`current`](Self::current) and keep using it
/// for as long as they like; [`reload`](Self::reload) swaps in a fresh
/// snapshot without disturbing them. A failed reload keeps the previous
/// rules in place.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    current: ArcSwap<RuleSet>,
}

impl ConfigStore {
    /// Load `path` and publish it as the initial snapshot.
    ///
    /// Any error here is fatal to startup: the gate must not serve without a
    /// valid rule set.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let rules = RuleSet::from_file(&path)?;
        info!(path = %path.display(), rules = rules.len(), "Rate limit rules loaded");
        Ok(Self::new(path, rules))
    }

    /// Create a store for `path` with an already-parsed initial rule set.
    pub fn new<P: Into<PathBuf>>(path: P, rules: RuleSet) -> Self {
        Self {
            path: path.into(),
            current: ArcSwap::from_pointee(rules),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the backing file without publishing it.
    pub fn load(&self) -> Result<RuleSet> {
        RuleSet::from_file(&self.path)
    }

    /// The latest published snapshot.
    pub fn current(&self) -> Arc<RuleSet> {
        self.current.load_full()
    }

    /// Publish `rules` as the new snapshot.
    pub fn publish(&self, rules: RuleSet) {
        self.current.store(Arc::new(rules));
    }

    /// Reload the backing file and publish the result.
    ///
    /// Errors are logged, never returned: on failure the current snapshot
    /// stays authoritative. Returns `true` if a new snapshot was published,
    /// `false` if loading failed or the rules are unchanged.
    pub fn reload(&self) -> bool {
        let rules = match self.load() {
            Ok(rules) => rules,
            Err(e) => {
                error!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to reload rate limit rules, keeping previous rules"
                );
                return false;
            }
        };

        if *self.current.load_full() == rules {
            debug!(path = %self.path.display(), "Rate limit rules unchanged");
            return false;
        }

        info!(
            path = %self.path.display(),
            rules = rules.len(),
            "Rate limit rules reloaded"
        );
        self.publish(rules);
        true
    }
}
