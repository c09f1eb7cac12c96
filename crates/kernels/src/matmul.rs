//! Matrix multiplication kernel variants.
//!
//! Each variant is a strategy that turns a [`KernelConfig`] into WGSL source
//! and a dispatch grid. All of them compute `C[i][j] = sum_k A[i][k] * B[j][k]`
//! with `A: M x K`, `B: N x K` and `C: M x N`, row-major.

use crate::config::{KernelConfig, Masking, MatmulProblem, Shape, Tiling, Variant};
use crate::error::ConfigError;
use crate::shaders;
use crate::template::{generate, ShaderCode};
use std::sync::Arc;
use tracing::debug;

/// Rendered source together with the number of workgroups to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSource {
    pub config: KernelConfig,
    pub code: ShaderCode,
    pub grid: Shape,
}

pub trait MatmulKernel: Send + Sync {
    fn name(&self) -> &'static str;
    fn variant(&self) -> Variant;
    fn template(&self, config: &KernelConfig) -> &'static str;
    fn dispatch_grid(&self, config: &KernelConfig) -> Shape;
    fn default_config(&self, problem: MatmulProblem) -> KernelConfig;
    /// Tilings worth sweeping when tuning `problem`.
    fn candidates(&self, problem: MatmulProblem) -> Vec<KernelConfig>;

    /// Validate `config` and render it into kernel source.
    fn render(&self, config: &KernelConfig) -> Result<KernelSource, ConfigError> {
        if config.variant() != self.variant() {
            return Err(ConfigError::InvalidTiling(format!(
                "{} kernel cannot render a {} configuration",
                self.name(),
                config.variant()
            )));
        }
        config.validate()?;

        let code = generate(
            self.template(config),
            &config.template_params(),
            config.workgroup,
        )?;
        let grid = self.dispatch_grid(config);
        debug!(
            kernel = self.name(),
            workgroup = %config.workgroup,
            grid = %grid,
            bytes = code.source().len(),
            "rendered matmul kernel"
        );
        Ok(KernelSource {
            config: *config,
            code,
            grid,
        })
    }
}

pub type DynMatmulKernel = Arc<dyn MatmulKernel>;

fn output_extent(problem: &MatmulProblem) -> Shape {
    Shape {
        x: problem.m as u32,
        y: problem.n as u32,
        z: 1,
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NaiveMatmul;

impl NaiveMatmul {
    pub fn new() -> Self {
        Self
    }
}

impl MatmulKernel for NaiveMatmul {
    fn name(&self) -> &'static str {
        "naive"
    }

    fn variant(&self) -> Variant {
        Variant::Naive
    }

    fn template(&self, _config: &KernelConfig) -> &'static str {
        shaders::NAIVE
    }

    fn dispatch_grid(&self, config: &KernelConfig) -> Shape {
        output_extent(&config.problem).cdiv(config.workgroup)
    }

    fn default_config(&self, problem: MatmulProblem) -> KernelConfig {
        KernelConfig::naive(problem, Shape { x: 16, y: 16, z: 1 })
    }

    fn candidates(&self, problem: MatmulProblem) -> Vec<KernelConfig> {
        [(8, 8), (16, 16), (32, 8), (8, 32), (64, 4)]
            .into_iter()
            .map(|(x, y)| KernelConfig::naive(problem, Shape { x, y, z: 1 }))
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TiledMatmul {
    tile_size: u32,
}

impl TiledMatmul {
    pub fn new() -> Self {
        Self { tile_size: 16 }
    }

    pub fn with_tile_size(tile_size: u32) -> Self {
        Self { tile_size }
    }
}

impl Default for TiledMatmul {
    fn default() -> Self {
        Self::new()
    }
}

impl MatmulKernel for TiledMatmul {
    fn name(&self) -> &'static str {
        "tiled"
    }

    fn variant(&self) -> Variant {
        Variant::Tiled
    }

    fn template(&self, config: &KernelConfig) -> &'static str {
        if config.needs_masking() {
            shaders::TILED_MASKED
        } else {
            shaders::TILED
        }
    }

    fn dispatch_grid(&self, config: &KernelConfig) -> Shape {
        let tile = match config.tiling {
            Tiling::SharedMemory { tile_size, .. } => tile_size,
            _ => 1,
        };
        output_extent(&config.problem).cdiv(Shape {
            x: tile,
            y: tile,
            z: 1,
        })
    }

    fn default_config(&self, problem: MatmulProblem) -> KernelConfig {
        KernelConfig::tiled(problem, self.tile_size, Masking::Auto)
    }

    fn candidates(&self, problem: MatmulProblem) -> Vec<KernelConfig> {
        [4, 8, 16]
            .into_iter()
            .map(|t| KernelConfig::tiled(problem, t, Masking::Auto))
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BlockTiledMatmul {
    bm: u32,
    bn: u32,
    bk: u32,
    tm: u32,
}

impl BlockTiledMatmul {
    pub fn new() -> Self {
        Self {
            bm: 64,
            bn: 32,
            bk: 8,
            tm: 8,
        }
    }

    pub fn with_blocks(bm: u32, bn: u32, bk: u32, tm: u32) -> Self {
        Self { bm, bn, bk, tm }
    }
}

impl Default for BlockTiledMatmul {
    fn default() -> Self {
        Self::new()
    }
}

impl MatmulKernel for BlockTiledMatmul {
    fn name(&self) -> &'static str {
        "block-tiled"
    }

    fn variant(&self) -> Variant {
        Variant::BlockTiled
    }

    fn template(&self, _config: &KernelConfig) -> &'static str {
        shaders::BLOCK_TILED
    }

    fn dispatch_grid(&self, config: &KernelConfig) -> Shape {
        let (bm, bn) = match config.tiling {
            Tiling::RegisterBlocked { bm, bn, .. } => (bm, bn),
            _ => (1, 1),
        };
        output_extent(&config.problem).cdiv(Shape { x: bm, y: bn, z: 1 })
    }

    fn default_config(&self, problem: MatmulProblem) -> KernelConfig {
        KernelConfig::block_tiled(problem, self.bm, self.bn, self.bk, self.tm)
    }

    fn candidates(&self, problem: MatmulProblem) -> Vec<KernelConfig> {
        let mut configs = Vec::new();
        for (bm, tm) in [(32, 4), (64, 8), (64, 4), (128, 8)] {
            for bn in [16, 32, 64] {
                for bk in [8, 16] {
                    configs.push(KernelConfig::block_tiled(problem, bm, bn, bk, tm));
                }
            }
        }
        configs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_renders_without_leftover_placeholders() {
        let problem = MatmulProblem::new(17, 33, 9);
        let kernels: [DynMatmulKernel; 3] = [
            Arc::new(NaiveMatmul::new()),
            Arc::new(TiledMatmul::new()),
            Arc::new(BlockTiledMatmul::new()),
        ];
        for kernel in kernels {
            let source = kernel.render(&kernel.default_config(problem)).unwrap();
            assert!(!source.code.source().contains("{{"), "{}", kernel.name());
            assert!(source.code.source().contains("@compute"));
        }
    }

    #[test]
    fn tiled_kernels_label_both_barriers() {
        let problem = MatmulProblem::new(32, 32, 32);
        for kernel in [
            &TiledMatmul::new() as &dyn MatmulKernel,
            &BlockTiledMatmul::new(),
        ] {
            let source = kernel.render(&kernel.default_config(problem)).unwrap();
            let text = source.code.source();
            assert_eq!(text.matches("workgroupBarrier()").count(), 2);
            assert!(text.contains(shaders::TILE_LOADED));
            assert!(text.contains(shaders::TILE_CONSUMED));
        }
    }

    #[test]
    fn tiled_switches_to_masked_source_for_ragged_shapes() {
        let kernel = TiledMatmul::new();
        let exact = kernel
            .render(&kernel.default_config(MatmulProblem::new(32, 32, 32)))
            .unwrap();
        let ragged = kernel
            .render(&kernel.default_config(MatmulProblem::new(17, 32, 32)))
            .unwrap();
        assert!(!exact.code.source().contains("min(row"));
        assert!(ragged.code.source().contains("min(row"));
        assert_eq!(ragged.grid, Shape { x: 2, y: 2, z: 1 });
    }

    #[test]
    fn grids_cover_the_output() {
        let problem = MatmulProblem::new(100, 64, 70);
        let naive = NaiveMatmul::new();
        assert_eq!(
            naive.dispatch_grid(&naive.default_config(problem)),
            Shape { x: 7, y: 5, z: 1 }
        );
        let blocked = BlockTiledMatmul::new();
        assert_eq!(
            blocked.dispatch_grid(&blocked.default_config(problem)),
            Shape { x: 2, y: 3, z: 1 }
        );
    }

    #[test]
    fn render_rejects_foreign_config() {
        let problem = MatmulProblem::new(16, 16, 16);
        let config = NaiveMatmul::new().default_config(problem);
        assert!(TiledMatmul::new().render(&config).is_err());
    }

    #[test]
    fn f16_source_enables_extension() {
        let problem = MatmulProblem::new(16, 16, 16).with_precision(crate::config::Precision::F16);
        let kernel = NaiveMatmul::new();
        let source = kernel.render(&kernel.default_config(problem)).unwrap();
        assert!(source.code.source().starts_with("enable f16;"));
        assert!(source.code.source().contains("array<f16>"));
    }
}
