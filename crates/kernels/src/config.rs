//! Kernel configuration structures.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Extents along three axes. Used for workgroup sizes and dispatch grids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Shape {
    pub fn new(x: u32, y: u32, z: u32) -> Result<Self, ConfigError> {
        for (name, value) in [("shape.x", x), ("shape.y", y), ("shape.z", z)] {
            if value == 0 {
                return Err(ConfigError::InvalidDimension {
                    name,
                    value: value as usize,
                });
            }
        }
        Ok(Self { x, y, z })
    }

    /// Shape with `x` lanes and unit `y`/`z`. `x` is clamped to at least 1.
    pub fn linear(x: u32) -> Self {
        Self {
            x: x.max(1),
            y: 1,
            z: 1,
        }
    }

    pub fn volume(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }

    /// Number of `tile`-sized blocks needed to cover `self` on every axis.
    pub fn cdiv(&self, tile: Shape) -> Shape {
        Shape {
            x: cdiv(self.x, tile.x),
            y: cdiv(self.y, tile.y),
            z: cdiv(self.z, tile.z),
        }
    }

    /// Comma separated form used by `@workgroup_size(...)`.
    pub fn wgsl(&self) -> String {
        format!("{}, {}, {}", self.x, self.y, self.z)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

pub fn cdiv(value: u32, divisor: u32) -> u32 {
    value.div_ceil(divisor.max(1))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Precision {
    #[default]
    F32,
    F16,
}

impl Precision {
    pub fn element_size_bytes(&self) -> usize {
        match self {
            Precision::F32 => 4,
            Precision::F16 => 2,
        }
    }

    pub fn wgsl_type(&self) -> &'static str {
        match self {
            Precision::F32 => "f32",
            Precision::F16 => "f16",
        }
    }

    /// Extension directive the generated source must open with.
    pub fn wgsl_enable(&self) -> &'static str {
        match self {
            Precision::F32 => "",
            Precision::F16 => "enable f16;",
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wgsl_type())
    }
}

/// `C[M x N] = A[M x K] * B[N x K]^T`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatmulProblem {
    pub m: usize,
    pub k: usize,
    pub n: usize,
    pub precision: Precision,
}

impl MatmulProblem {
    pub fn new(m: usize, k: usize, n: usize) -> Self {
        Self {
            m,
            k,
            n,
            precision: Precision::F32,
        }
    }

    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    pub fn flops(&self) -> f64 {
        2.0 * self.m as f64 * self.n as f64 * self.k as f64
    }

    pub fn data_footprint_bytes(&self) -> usize {
        (self.m * self.k + self.n * self.k + self.m * self.n) * self.precision.element_size_bytes()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [("M", self.m), ("K", self.k), ("N", self.n)] {
            if value == 0 {
                return Err(ConfigError::InvalidDimension { name, value });
            }
        }
        for (what, elements) in [
            ("A", self.m.saturating_mul(self.k)),
            ("B", self.n.saturating_mul(self.k)),
            ("C", self.m.saturating_mul(self.n)),
        ] {
            if elements > u32::MAX as usize {
                return Err(ConfigError::IndexOverflow { what, elements });
            }
        }
        Ok(())
    }
}

/// Named problem sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProblemPreset {
    Tiny,
    Small,
    Large,
}

impl ProblemPreset {
    pub fn problem(&self) -> MatmulProblem {
        match self {
            ProblemPreset::Tiny => MatmulProblem::new(16, 4, 8),
            ProblemPreset::Small => MatmulProblem::new(256, 128, 512),
            ProblemPreset::Large => MatmulProblem::new(4096, 4096, 2 * 4096),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Variant {
    Naive,
    Tiled,
    BlockTiled,
}

impl Variant {
    pub const ALL: [Variant; 3] = [Variant::Naive, Variant::Tiled, Variant::BlockTiled];

    pub fn name(&self) -> &'static str {
        match self {
            Variant::Naive => "naive",
            Variant::Tiled => "tiled",
            Variant::BlockTiled => "block-tiled",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether the shared-memory kernel guards its tile loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Masking {
    /// Unmasked when the tile divides M, K and N, masked otherwise.
    #[default]
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tiling {
    Naive,
    SharedMemory {
        tile_size: u32,
        masking: Masking,
    },
    RegisterBlocked {
        bm: u32,
        bn: u32,
        bk: u32,
        tm: u32,
    },
}

impl Tiling {
    pub fn variant(&self) -> Variant {
        match self {
            Tiling::Naive => Variant::Naive,
            Tiling::SharedMemory { .. } => Variant::Tiled,
            Tiling::RegisterBlocked { .. } => Variant::BlockTiled,
        }
    }
}

/// Full parameter set for one compiled kernel. Identity key for caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelConfig {
    pub problem: MatmulProblem,
    pub tiling: Tiling,
    pub workgroup: Shape,
}

impl KernelConfig {
    pub fn naive(problem: MatmulProblem, workgroup: Shape) -> Self {
        Self {
            problem,
            tiling: Tiling::Naive,
            workgroup,
        }
    }

    /// Square tiles of `tile_size`, one lane per tile element.
    pub fn tiled(problem: MatmulProblem, tile_size: u32, masking: Masking) -> Self {
        Self {
            problem,
            tiling: Tiling::SharedMemory { tile_size, masking },
            workgroup: Shape::linear(tile_size.saturating_mul(tile_size)),
        }
    }

    /// `BM x BN` output block per workgroup, `TM` rows per lane.
    pub fn block_tiled(problem: MatmulProblem, bm: u32, bn: u32, bk: u32, tm: u32) -> Self {
        let lanes = if tm == 0 { 0 } else { (bm / tm).saturating_mul(bn) };
        Self {
            problem,
            tiling: Tiling::RegisterBlocked { bm, bn, bk, tm },
            workgroup: Shape::linear(lanes),
        }
    }

    pub fn variant(&self) -> Variant {
        self.tiling.variant()
    }

    /// Whether the shared-memory kernel must mask its tile loads.
    pub fn needs_masking(&self) -> bool {
        match self.tiling {
            Tiling::SharedMemory { tile_size, masking } => match masking {
                Masking::Always => true,
                Masking::Never => false,
                Masking::Auto => {
                    let t = tile_size as usize;
                    let p = &self.problem;
                    p.m % t != 0 || p.k % t != 0 || p.n % t != 0
                }
            },
            _ => false,
        }
    }

    /// Shared scratch required per workgroup, in elements.
    pub fn scratch_elements(&self) -> u64 {
        match self.tiling {
            Tiling::Naive => 0,
            Tiling::SharedMemory { tile_size, .. } => 2 * tile_size as u64 * tile_size as u64,
            Tiling::RegisterBlocked { bm, bn, bk, .. } => (bm as u64 + bn as u64) * bk as u64,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.problem.validate()?;
        Shape::new(self.workgroup.x, self.workgroup.y, self.workgroup.z)?;

        match self.tiling {
            Tiling::Naive => {
                if self.workgroup.z != 1 {
                    return Err(ConfigError::InvalidTiling(format!(
                        "naive workgroups are planar, got z = {}",
                        self.workgroup.z
                    )));
                }
                Ok(())
            }
            Tiling::SharedMemory { tile_size, masking } => {
                if tile_size == 0 {
                    return Err(ConfigError::InvalidTiling(
                        "tile size must be positive".into(),
                    ));
                }
                let lanes = tile_size.checked_mul(tile_size).ok_or_else(|| {
                    ConfigError::InvalidTiling(format!(
                        "tile size {tile_size} overflows the workgroup lane count"
                    ))
                })?;
                let expected = Shape::linear(lanes);
                if self.workgroup != expected {
                    return Err(ConfigError::WorkgroupMismatch {
                        expected: expected.to_string(),
                        actual: self.workgroup.to_string(),
                    });
                }
                if masking == Masking::Never {
                    let t = tile_size as usize;
                    let p = &self.problem;
                    if p.m % t != 0 || p.k % t != 0 || p.n % t != 0 {
                        return Err(ConfigError::InvalidTiling(format!(
                            "unmasked tiles of {t} require M={}, K={}, N={} to be multiples of {t}",
                            p.m, p.k, p.n
                        )));
                    }
                }
                Ok(())
            }
            Tiling::RegisterBlocked { bm, bn, bk, tm } => {
                if bm == 0 || bn == 0 || bk == 0 || tm == 0 {
                    return Err(ConfigError::InvalidTiling(format!(
                        "block parameters must be positive (BM={bm}, BN={bn}, BK={bk}, TM={tm})"
                    )));
                }
                if bm % tm != 0 {
                    return Err(ConfigError::InvalidTiling(format!(
                        "BM={bm} must be a multiple of TM={tm}"
                    )));
                }
                let lanes = (bm / tm).checked_mul(bn).ok_or_else(|| {
                    ConfigError::InvalidTiling(format!(
                        "BM/TM = {} times BN = {bn} overflows the workgroup lane count",
                        bm / tm
                    ))
                })?;
                let expected = Shape::linear(lanes);
                if self.workgroup != expected {
                    return Err(ConfigError::WorkgroupMismatch {
                        expected: expected.to_string(),
                        actual: self.workgroup.to_string(),
                    });
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelProfile {
    pub kernel: String,
    pub config: KernelConfig,
    pub average_time_ms: f64,
    pub gflops: f64,
}

impl KernelProfile {
    pub fn new(kernel: &str, config: KernelConfig, average_time_ms: f64) -> Self {
        let gflops = if average_time_ms > 0.0 {
            config.problem.flops() / (average_time_ms * 1.0e6)
        } else {
            0.0
        };

        Self {
            kernel: kernel.to_string(),
            config,
            average_time_ms,
            gflops,
        }
    }
}
