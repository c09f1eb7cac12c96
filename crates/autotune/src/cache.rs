//! Result caching for autotuning.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tileforge_kernels::config::{KernelProfile, MatmulProblem, Variant};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AutotuneCache {
    matmul: HashMap<String, KernelProfile>,
}

impl AutotuneCache {
    pub fn new() -> Self {
        Self {
            matmul: HashMap::new(),
        }
    }

    pub fn get_matmul(&self, problem: &MatmulProblem, variant: Variant) -> Option<&KernelProfile> {
        self.matmul.get(&problem_key(problem, variant))
    }

    pub fn insert_matmul(&mut self, profile: KernelProfile) {
        let key = problem_key(&profile.config.problem, profile.config.variant());
        self.matmul.insert(key, profile);
    }

    pub fn len(&self) -> usize {
        self.matmul.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matmul.is_empty()
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let data = fs::read(path)?;
        let cache = serde_json::from_slice(&data)?;
        Ok(cache)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let blob = serde_json::to_vec_pretty(self)?;
        fs::write(path, blob)?;
        Ok(())
    }
}

fn problem_key(problem: &MatmulProblem, variant: Variant) -> String {
    format!(
        "{}/{}x{}x{}/{}",
        variant, problem.m, problem.k, problem.n, problem.precision
    )
}
