//! Store handle for covenant's on-disk state.
//!
//! A store is rooted at `<repo>/.covenant/` and holds the knowledge snapshot
//! database and the proposal ledger. The constitution itself lives outside
//! the store, under `<repo>/constitution/`, because it is operator-authored
//! input rather than derived state.

use crate::core::error::CovenantError;
use std::fs;
use std::path::{Path, PathBuf};

pub const STORE_DIR: &str = ".covenant";
pub const CONSTITUTION_DIR: &str = "constitution";
pub const KNOWLEDGE_DB_NAME: &str = "knowledge.db";

/// Handle to one governed repository.
#[derive(Debug, Clone)]
pub struct Store {
    /// Repository root (the tree being governed).
    pub repo_root: PathBuf,
    /// Absolute path to the `.covenant/` state directory.
    pub root: PathBuf,
}

impl Store {
    /// Open (creating on first use) the store for a repository root.
    pub fn open(repo_root: &Path) -> Result<Store, CovenantError> {
        let root = repo_root.join(STORE_DIR);
        fs::create_dir_all(&root)?;
        Ok(Store {
            repo_root: repo_root.to_path_buf(),
            root,
        })
    }

    pub fn constitution_dir(&self) -> PathBuf {
        self.repo_root.join(CONSTITUTION_DIR)
    }

    pub fn knowledge_db_path(&self) -> PathBuf {
        self.root.join(KNOWLEDGE_DB_NAME)
    }

    pub fn proposals_dir(&self) -> PathBuf {
        self.root.join("proposals")
    }

    pub fn proposal_archive_dir(&self) -> PathBuf {
        self.root.join("proposals").join("archive")
    }
}
