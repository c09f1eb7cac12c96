//! Kernel registry for lookup and discovery.

use crate::config::Variant;
use crate::matmul::{DynMatmulKernel, MatmulKernel};
use std::sync::Arc;

#[derive(Default, Clone)]
pub struct KernelRegistry {
    matmul_kernels: Vec<DynMatmulKernel>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self {
            matmul_kernels: Vec::new(),
        }
    }

    pub fn with_default_kernels() -> Self {
        let mut registry = Self::new();
        registry.register(crate::matmul::NaiveMatmul::new());
        registry.register(crate::matmul::TiledMatmul::new());
        registry.register(crate::matmul::BlockTiledMatmul::new());
        registry
    }

    /// Registers `kernel`, replacing any kernel already serving its variant.
    pub fn register<K>(&mut self, kernel: K)
    where
        K: MatmulKernel + 'static,
    {
        self.matmul_kernels
            .retain(|existing| existing.variant() != kernel.variant());
        self.matmul_kernels.push(Arc::new(kernel));
    }

    pub fn kernels(&self) -> &[DynMatmulKernel] {
        &self.matmul_kernels
    }

    pub fn find(&self, variant: Variant) -> Option<DynMatmulKernel> {
        self.matmul_kernels
            .iter()
            .find(|kernel| kernel.variant() == variant)
            .map(Arc::clone)
    }

    pub fn find_by_name(&self, name: &str) -> Option<DynMatmulKernel> {
        self.matmul_kernels
            .iter()
            .find(|kernel| kernel.name() == name)
            .map(Arc::clone)
    }
}
