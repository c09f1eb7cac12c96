//! Barrier mutants for the tiled kernels.
//!
//! A mutant is rendered kernel source with one synchronization point removed.
//! A test suite that cannot tell a mutant from the unmutated kernel is not
//! exercising the race the barrier prevents.

use crate::shaders::{TILE_CONSUMED, TILE_LOADED};
use crate::template::ShaderCode;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BarrierSite {
    /// Between the cooperative tile load and the first read of the tile.
    TileLoaded,
    /// Between the last read of a tile and the load that overwrites it.
    TileConsumed,
}

impl BarrierSite {
    pub const ALL: [BarrierSite; 2] = [BarrierSite::TileLoaded, BarrierSite::TileConsumed];

    pub fn label(&self) -> &'static str {
        match self {
            BarrierSite::TileLoaded => TILE_LOADED,
            BarrierSite::TileConsumed => TILE_CONSUMED,
        }
    }
}

/// Which labelled barriers a kernel source still contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierPolicy {
    pub tile_loaded: bool,
    pub tile_consumed: bool,
}

impl BarrierPolicy {
    pub const FULL: BarrierPolicy = BarrierPolicy {
        tile_loaded: true,
        tile_consumed: true,
    };

    pub fn from_source(source: &str) -> Self {
        let has = |site: BarrierSite| {
            source.lines().any(|line| {
                let line = line.trim_start();
                line.starts_with("workgroupBarrier()") && line.contains(site.label())
            })
        };
        Self {
            tile_loaded: has(BarrierSite::TileLoaded),
            tile_consumed: has(BarrierSite::TileConsumed),
        }
    }

    pub fn contains(&self, site: BarrierSite) -> bool {
        match site {
            BarrierSite::TileLoaded => self.tile_loaded,
            BarrierSite::TileConsumed => self.tile_consumed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Mutant {
    pub description: String,
    pub removed: BarrierSite,
    pub code: ShaderCode,
}

/// `code` with the barrier at `site` deleted. `None` if the site is absent.
pub fn drop_barrier(code: &ShaderCode, site: BarrierSite) -> Option<ShaderCode> {
    let mut removed = false;
    let source: String = code
        .source()
        .lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            let hit = trimmed.starts_with("workgroupBarrier()") && trimmed.contains(site.label());
            removed |= hit;
            !hit
        })
        .flat_map(|line| [line, "\n"])
        .collect();

    removed.then(|| ShaderCode::new(source, code.workgroup()))
}

/// One mutant per barrier present in `code`.
pub fn barrier_mutants(code: &ShaderCode) -> Vec<Mutant> {
    BarrierSite::ALL
        .into_iter()
        .filter_map(|site| {
            drop_barrier(code, site).map(|mutated| Mutant {
                description: format!("removed barrier `{}`", site.label()),
                removed: site,
                code: mutated,
            })
        })
        .collect()
}
