// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Local store collaborator.
//!
//! The dispatcher never implements content addressing itself. It asks the
//! local store for input closures and archives, and hands retrieved outputs
//! back to it.

use async_trait::async_trait;
use rbd_core::StorePath;
use rbd_wire::ExportedPath;
use std::collections::BTreeSet;
use thiserror::Error;

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("path not in local store: {0}")]
    NotFound(StorePath),
    #[error("store error: {0}")]
    Other(String),
}

/// Content-addressed store on the dispatching host.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// `paths` plus everything they reference, dependencies before dependents.
    async fn closure(&self, paths: &BTreeSet<StorePath>) -> Result<Vec<StorePath>, StoreError>;

    async fn is_valid(&self, path: &StorePath) -> Result<bool, StoreError>;

    /// Serialize one valid path for transfer. The archive is a complete NAR.
    async fn export_path(&self, path: &StorePath) -> Result<ExportedPath, StoreError>;

    /// Register a path received from a worker. Importing a present path is a no-op.
    async fn import_path(&self, exported: ExportedPath) -> Result<(), StoreError>;
}

#[cfg(any(test, feature = "test-support"))]
#[cfg_attr(coverage_nightly, coverage(off))]
mod fake {
    use super::{Store, StoreError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rbd_core::StorePath;
    use rbd_wire::{nar_regular, ExportedPath};
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;

    #[derive(Default)]
    struct FakeStoreState {
        objects: BTreeMap<StorePath, ExportedPath>,
        exported: Vec<StorePath>,
        imported: Vec<StorePath>,
    }

    /// In-memory store for tests
    #[derive(Clone, Default)]
    pub struct FakeStore {
        inner: Arc<Mutex<FakeStoreState>>,
    }

    impl FakeStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Add a path holding a single file with `contents`.
        pub fn add(&self, path: impl Into<StorePath>, references: &[&str], contents: &[u8]) {
            let path = path.into();
            let exported = ExportedPath {
                path: path.clone(),
                archive: nar_regular(contents),
                references: references.iter().map(|r| StorePath::from(*r)).collect(),
                deriver: None,
            };
            self.inner.lock().objects.insert(path, exported);
        }

        pub fn contains(&self, path: &str) -> bool {
            self.inner.lock().objects.contains_key(path)
        }

        /// Paths handed out by `export_path`, in call order
        pub fn exported(&self) -> Vec<StorePath> {
            self.inner.lock().exported.clone()
        }

        /// Paths received through `import_path`, in call order
        pub fn imported(&self) -> Vec<StorePath> {
            self.inner.lock().imported.clone()
        }
    }

    #[async_trait]
    impl Store for FakeStore {
        async fn closure(&self, paths: &BTreeSet<StorePath>) -> Result<Vec<StorePath>, StoreError> {
            let state = self.inner.lock();
            let mut seen = BTreeSet::new();
            let mut order = Vec::new();
            // (path, references already pushed)
            let mut stack: Vec<(StorePath, bool)> =
                paths.iter().rev().map(|p| (p.clone(), false)).collect();
            while let Some((path, expanded)) = stack.pop() {
                if expanded {
                    order.push(path);
                    continue;
                }
                if !seen.insert(path.clone()) {
                    continue;
                }
                let object =
                    state.objects.get(&path).ok_or_else(|| StoreError::NotFound(path.clone()))?;
                stack.push((path.clone(), true));
                for reference in object.references.iter().rev() {
                    if !seen.contains(reference) {
                        stack.push((reference.clone(), false));
                    }
                }
            }
            Ok(order)
        }

        async fn is_valid(&self, path: &StorePath) -> Result<bool, StoreError> {
            Ok(self.inner.lock().objects.contains_key(path))
        }

        async fn export_path(&self, path: &StorePath) -> Result<ExportedPath, StoreError> {
            let mut state = self.inner.lock();
            let exported =
                state.objects.get(path).cloned().ok_or_else(|| StoreError::NotFound(path.clone()))?;
            state.exported.push(path.clone());
            Ok(exported)
        }

        async fn import_path(&self, exported: ExportedPath) -> Result<(), StoreError> {
            let mut state = self.inner.lock();
            state.imported.push(exported.path.clone());
            state.objects.entry(exported.path.clone()).or_insert(exported);
            Ok(())
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
pub use fake::FakeStore;

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
