// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Derivations and build tasks.
//!
//! A derivation here is the *basic* form sent to a worker: its inputs are
//! already resolved to store paths, so the worker needs nothing but the
//! closure of `inputs` to run `builder`.

use crate::store_path::StorePath;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Reasons a derivation cannot be submitted to any worker.
#[derive(Debug, Error)]
pub enum DerivationError {
    #[error("derivation has an empty builder")]
    EmptyBuilder,
    #[error("derivation declares no outputs")]
    NoOutputs,
    #[error("output `{0}` has no store path")]
    EmptyOutputPath(String),
    #[error("derivation has no platform")]
    EmptyPlatform,
    #[error("invalid derivation json: {0}")]
    Json(#[from] serde_json::Error),
}

/// One declared output of a derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivationOutput {
    pub path: StorePath,
    /// Hash algorithm for fixed-output derivations (empty otherwise)
    #[serde(default)]
    pub hash_algo: String,
    #[serde(default)]
    pub hash: String,
}

impl DerivationOutput {
    pub fn new(path: impl Into<StorePath>) -> Self {
        Self { path: path.into(), hash_algo: String::new(), hash: String::new() }
    }
}

/// Fully specified build step: command, environment, inputs and outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Derivation {
    pub outputs: BTreeMap<String, DerivationOutput>,
    #[serde(default)]
    pub inputs: BTreeSet<StorePath>,
    pub platform: String,
    pub builder: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Derivation {
    pub fn new(platform: impl Into<String>, builder: impl Into<String>) -> Self {
        Self {
            outputs: BTreeMap::new(),
            inputs: BTreeSet::new(),
            platform: platform.into(),
            builder: builder.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    crate::setters! {
        set {
            args: Vec<String>,
            env: BTreeMap<String, String>,
        }
    }

    pub fn output(mut self, name: impl Into<String>, path: impl Into<StorePath>) -> Self {
        self.outputs.insert(name.into(), DerivationOutput::new(path));
        self
    }

    pub fn input(mut self, path: impl Into<StorePath>) -> Self {
        self.inputs.insert(path.into());
        self
    }

    /// Check the derivation is well-formed enough to hand to a worker.
    pub fn validate(&self) -> Result<(), DerivationError> {
        if self.builder.trim().is_empty() {
            return Err(DerivationError::EmptyBuilder);
        }
        if self.platform.trim().is_empty() {
            return Err(DerivationError::EmptyPlatform);
        }
        if self.outputs.is_empty() {
            return Err(DerivationError::NoOutputs);
        }
        if let Some((name, _)) = self.outputs.iter().find(|(_, out)| out.path.is_empty()) {
            return Err(DerivationError::EmptyOutputPath(name.clone()));
        }
        Ok(())
    }

    /// Store paths of all declared outputs.
    pub fn output_paths(&self) -> BTreeSet<StorePath> {
        self.outputs.values().map(|o| o.path.clone()).collect()
    }
}

/// A derivation together with the store path it was loaded from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTask {
    pub drv_path: StorePath,
    pub drv: Derivation,
}

impl BuildTask {
    pub fn new(drv_path: impl Into<StorePath>, drv: Derivation) -> Self {
        Self { drv_path: drv_path.into(), drv }
    }

    /// Parse a task from its JSON form (`{"drv_path": ..., "drv": {...}}`).
    pub fn from_json(json: &str) -> Result<Self, DerivationError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Short name used in logs (`<hash>-<name>.drv`).
    pub fn name(&self) -> &str {
        self.drv_path.base_name()
    }
}

#[cfg(test)]
#[path = "derivation_tests.rs"]
mod tests;
