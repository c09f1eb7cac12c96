//! Workgroup interpreter for the generated matmul kernels.
//!
//! Each workgroup is executed as a list of barrier-free segments. Within a
//! segment lanes run one after another, so a lane observes shared scratch
//! exactly as the lanes before it left it. With every barrier present this
//! matches any legal GPU schedule; with one missing, the race shows up
//! deterministically as stale or overwritten tile data.

use rayon::prelude::*;
use tileforge_kernels::{BarrierPolicy, KernelConfig, Precision, Shape, Tiling};

/// Output of one workgroup: `(index into C, value)` pairs.
type Writes = Vec<(usize, f32)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Load(usize),
    Compute(usize),
}

/// Split the K loop into barrier-free segments.
fn schedule(tiles: usize, barriers: BarrierPolicy) -> Vec<Vec<Step>> {
    let mut segments = Vec::new();
    let mut current = Vec::new();
    for tile in 0..tiles {
        current.push(Step::Load(tile));
        if barriers.tile_loaded {
            segments.push(std::mem::take(&mut current));
        }
        current.push(Step::Compute(tile));
        if barriers.tile_consumed {
            segments.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

/// Read-only view of the two operand buffers.
struct Operands<'a> {
    a: &'a [f32],
    b: &'a [f32],
}

impl Operands<'_> {
    fn a(&self, index: usize) -> Result<f32, String> {
        read(self.a, "A", index)
    }

    fn b(&self, index: usize) -> Result<f32, String> {
        read(self.b, "B", index)
    }
}

fn read(buffer: &[f32], name: &str, index: usize) -> Result<f32, String> {
    buffer.get(index).copied().ok_or_else(|| {
        format!(
            "out-of-bounds read of {name}[{index}] (buffer holds {} elements)",
            buffer.len()
        )
    })
}

fn mask(in_bounds: bool) -> f32 {
    if in_bounds {
        1.0
    } else {
        0.0
    }
}

/// Arithmetic at the kernel's element precision.
#[derive(Debug, Clone, Copy)]
struct Arith(Precision);

impl Arith {
    fn round(&self, value: f32) -> f32 {
        match self.0 {
            Precision::F32 => value,
            Precision::F16 => half::f16::from_f32(value).to_f32(),
        }
    }

    /// `acc += lhs * rhs` with per-operation rounding.
    fn mul_add(&self, acc: f32, lhs: f32, rhs: f32) -> f32 {
        self.round(acc + self.round(lhs * rhs))
    }
}

/// Shared-memory workgroup: lanes cooperate through `scratch` tiles.
trait TiledGroup {
    fn lanes(&self) -> usize;
    fn tiles(&self) -> usize;
    /// Accumulators private to one lane.
    fn accumulators(&self) -> usize;
    fn scratch_len(&self) -> (usize, usize);

    fn load(
        &self,
        lane: usize,
        tile: usize,
        ops: &Operands<'_>,
        tile_a: &mut [f32],
        tile_b: &mut [f32],
    ) -> Result<(), String>;

    fn compute(&self, lane: usize, tile_a: &[f32], tile_b: &[f32], acc: &mut [f32]);

    fn store(&self, lane: usize, acc: &[f32], writes: &mut Writes);
}

fn run_tiled_group<G: TiledGroup>(
    group: &G,
    barriers: BarrierPolicy,
    ops: &Operands<'_>,
) -> Result<Writes, String> {
    let (a_len, b_len) = group.scratch_len();
    // Workgroup memory starts zeroed.
    let mut tile_a = vec![0.0f32; a_len];
    let mut tile_b = vec![0.0f32; b_len];
    let stride = group.accumulators();
    let mut acc = vec![0.0f32; group.lanes() * stride];

    for segment in schedule(group.tiles(), barriers) {
        for lane in 0..group.lanes() {
            let lane_acc = &mut acc[lane * stride..(lane + 1) * stride];
            for step in &segment {
                match *step {
                    Step::Load(tile) => group.load(lane, tile, ops, &mut tile_a, &mut tile_b)?,
                    Step::Compute(_) => group.compute(lane, &tile_a, &tile_b, lane_acc),
                }
            }
        }
    }

    let mut writes = Vec::with_capacity(group.lanes() * stride);
    for lane in 0..group.lanes() {
        group.store(lane, &acc[lane * stride..(lane + 1) * stride], &mut writes);
    }
    Ok(writes)
}

struct SharedTileGroup {
    m: usize,
    k: usize,
    n: usize,
    t: usize,
    masked: bool,
    group_row: usize,
    group_col: usize,
    arith: Arith,
}

impl SharedTileGroup {
    fn coords(&self, lane: usize) -> (usize, usize, usize, usize) {
        let load_row = lane / self.t;
        let load_col = lane % self.t;
        let row = self.group_row * self.t + load_row;
        let col = self.group_col * self.t + load_col;
        (load_row, load_col, row, col)
    }
}

impl TiledGroup for SharedTileGroup {
    fn lanes(&self) -> usize {
        self.t * self.t
    }

    fn tiles(&self) -> usize {
        self.k.div_ceil(self.t)
    }

    fn accumulators(&self) -> usize {
        1
    }

    fn scratch_len(&self) -> (usize, usize) {
        (self.t * self.t, self.t * self.t)
    }

    fn load(
        &self,
        lane: usize,
        tile: usize,
        ops: &Operands<'_>,
        tile_a: &mut [f32],
        tile_b: &mut [f32],
    ) -> Result<(), String> {
        let (m, k, n, t) = (self.m, self.k, self.n, self.t);
        let (load_row, load_col, row, col) = self.coords(lane);
        let a_col = tile * t + load_col;
        let b_col = tile * t + load_row;

        let (a_value, b_value) = if self.masked {
            (
                ops.a(row.min(m - 1) * k + a_col.min(k - 1))? * mask(row < m && a_col < k),
                ops.b(col.min(n - 1) * k + b_col.min(k - 1))? * mask(col < n && b_col < k),
            )
        } else {
            (ops.a(row * k + a_col)?, ops.b(col * k + b_col)?)
        };
        tile_a[load_row * t + load_col] = a_value;
        tile_b[load_col * t + load_row] = b_value;
        Ok(())
    }

    fn compute(&self, lane: usize, tile_a: &[f32], tile_b: &[f32], acc: &mut [f32]) {
        let t = self.t;
        let (load_row, load_col, _, _) = self.coords(lane);
        for kk in 0..t {
            acc[0] = self
                .arith
                .mul_add(acc[0], tile_a[load_row * t + kk], tile_b[load_col * t + kk]);
        }
    }

    fn store(&self, lane: usize, acc: &[f32], writes: &mut Writes) {
        let (_, _, row, col) = self.coords(lane);
        if !self.masked || (row < self.m && col < self.n) {
            writes.push((row * self.n + col, acc[0]));
        }
    }
}

struct RegisterBlockGroup {
    m: usize,
    k: usize,
    n: usize,
    bm: usize,
    bn: usize,
    bk: usize,
    tm: usize,
    block_row: usize,
    block_col: usize,
    arith: Arith,
}

impl TiledGroup for RegisterBlockGroup {
    fn lanes(&self) -> usize {
        (self.bm / self.tm) * self.bn
    }

    fn tiles(&self) -> usize {
        self.k.div_ceil(self.bk)
    }

    fn accumulators(&self) -> usize {
        self.tm
    }

    fn scratch_len(&self) -> (usize, usize) {
        (self.bm * self.bk, self.bn * self.bk)
    }

    fn load(
        &self,
        lane: usize,
        tile: usize,
        ops: &Operands<'_>,
        tile_a: &mut [f32],
        tile_b: &mut [f32],
    ) -> Result<(), String> {
        let (m, k, n, bk) = (self.m, self.k, self.n, self.bk);
        let lanes = self.lanes();
        let bk_idx = tile * bk;

        for i in (lane..self.bm * bk).step_by(lanes) {
            let a_row = self.block_row + i / bk;
            let a_col = bk_idx + i % bk;
            tile_a[i] =
                ops.a(a_row.min(m - 1) * k + a_col.min(k - 1))? * mask(a_row < m && a_col < k);
        }
        for i in (lane..self.bn * bk).step_by(lanes) {
            let b_row = self.block_col + i / bk;
            let b_col = bk_idx + i % bk;
            tile_b[i] =
                ops.b(b_row.min(n - 1) * k + b_col.min(k - 1))? * mask(b_row < n && b_col < k);
        }
        Ok(())
    }

    fn compute(&self, lane: usize, tile_a: &[f32], tile_b: &[f32], acc: &mut [f32]) {
        let thread_row = lane / self.bn;
        let thread_col = lane % self.bn;
        for dot in 0..self.bk {
            let tmp = tile_b[thread_col * self.bk + dot];
            for (res, slot) in acc.iter_mut().enumerate() {
                let a = tile_a[(thread_row * self.tm + res) * self.bk + dot];
                *slot = self.arith.mul_add(*slot, a, tmp);
            }
        }
    }

    fn store(&self, lane: usize, acc: &[f32], writes: &mut Writes) {
        let thread_row = lane / self.bn;
        let thread_col = lane % self.bn;
        for (res, value) in acc.iter().enumerate() {
            let inner_row = thread_row * self.tm + res;
            let out_row = self.block_row + inner_row;
            let out_col = self.block_col + thread_col;
            if inner_row < self.bm && thread_col < self.bn && out_row < self.m && out_col < self.n {
                writes.push((out_row * self.n + out_col, *value));
            }
        }
    }
}

/// A compiled kernel as the simulator executes it.
#[derive(Debug, Clone)]
pub struct WorkgroupProgram {
    config: KernelConfig,
    grid: Shape,
    barriers: BarrierPolicy,
    masked: bool,
}

impl WorkgroupProgram {
    pub fn new(config: KernelConfig, grid: Shape, barriers: BarrierPolicy) -> Self {
        Self {
            masked: config.needs_masking(),
            config,
            grid,
            barriers,
        }
    }

    pub fn barriers(&self) -> BarrierPolicy {
        self.barriers
    }

    pub fn grid(&self) -> Shape {
        self.grid
    }

    /// Runs every workgroup of the grid and scatters the results into `c`.
    pub fn execute(&self, a: &[f32], b: &[f32], c: &mut [f32]) -> Result<(), String> {
        let ops = Operands { a, b };
        let groups: Vec<[usize; 3]> = (0..self.grid.z as usize)
            .flat_map(|z| {
                (0..self.grid.y as usize)
                    .flat_map(move |y| (0..self.grid.x as usize).map(move |x| [x, y, z]))
            })
            .collect();

        let per_group = groups
            .par_iter()
            .map(|group| self.run_group(*group, &ops))
            .collect::<Result<Vec<_>, String>>()?;

        let len = c.len();
        for (index, value) in per_group.into_iter().flatten() {
            let slot = c.get_mut(index).ok_or_else(|| {
                format!("out-of-bounds write of C[{index}] (buffer holds {len} elements)")
            })?;
            *slot = value;
        }
        Ok(())
    }

    fn run_group(&self, group: [usize; 3], ops: &Operands<'_>) -> Result<Writes, String> {
        let problem = &self.config.problem;
        let (m, k, n) = (problem.m, problem.k, problem.n);
        let arith = Arith(problem.precision);

        match self.config.tiling {
            Tiling::Naive => self.run_naive_group(group, ops, arith),
            Tiling::SharedMemory { tile_size, .. } => {
                let tiled = SharedTileGroup {
                    m,
                    k,
                    n,
                    t: tile_size as usize,
                    masked: self.masked,
                    group_row: group[0],
                    group_col: group[1],
                    arith,
                };
                run_tiled_group(&tiled, self.barriers, ops)
            }
            Tiling::RegisterBlocked { bm, bn, bk, tm } => {
                let blocked = RegisterBlockGroup {
                    m,
                    k,
                    n,
                    bm: bm as usize,
                    bn: bn as usize,
                    bk: bk as usize,
                    tm: tm as usize,
                    block_row: group[0] * bm as usize,
                    block_col: group[1] * bn as usize,
                    arith,
                };
                run_tiled_group(&blocked, self.barriers, ops)
            }
        }
    }

    fn run_naive_group(
        &self,
        group: [usize; 3],
        ops: &Operands<'_>,
        arith: Arith,
    ) -> Result<Writes, String> {
        let problem = &self.config.problem;
        let (m, k, n) = (problem.m, problem.k, problem.n);
        let wg = self.config.workgroup;
        let mut writes = Vec::new();

        // Naive workgroups are planar; `validate` rejects z != 1.
        for ly in 0..wg.y as usize {
            for lx in 0..wg.x as usize {
                let row = group[0] * wg.x as usize + lx;
                let col = group[1] * wg.y as usize + ly;
                if row >= m || col >= n {
                    continue;
                }
                let mut total = 0.0f32;
                for kk in 0..k {
                    total = arith.mul_add(total, ops.a(row * k + kk)?, ops.b(col * k + kk)?);
                }
                writes.push((row * n + col, total));
            }
        }
        Ok(writes)
    }
}
