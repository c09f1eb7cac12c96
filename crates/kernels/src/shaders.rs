//! WGSL templates for the matmul variants.
//!
//! All variants bind `A` (M x K), `B` (N x K, i.e. transposed) and `C` (M x N),
//! row-major. Barrier lines carry a `sync:` label so tooling can locate them.
//! Array sizes are host-computed literals; the WGSL front end in wgpu 0.19
//! does not fold `a * b` in a type.

/// Label on the barrier that publishes a freshly loaded tile.
pub const TILE_LOADED: &str = "sync: tile-loaded";
/// Label on the barrier that retires a tile before it is overwritten.
pub const TILE_CONSUMED: &str = "sync: tile-consumed";

/// One lane per output element, operands streamed from global memory.
pub const NAIVE: &str = r#"{{enable}}
@group(0) @binding(0) var<storage, read> A: array<{{precision}}>;
@group(0) @binding(1) var<storage, read> B: array<{{precision}}>;
@group(0) @binding(2) var<storage, read_write> C: array<{{precision}}>;

@compute @workgroup_size({{workgroupSize}})
fn main(@builtin(global_invocation_id) globalID: vec3<u32>) {
    let row = globalID.x;
    let col = globalID.y;
    if (row >= {{M}}u || col >= {{N}}u) {
        return;
    }
    var total: {{precision}} = 0.0;
    for (var k = 0u; k < {{K}}u; k = k + 1u) {
        total += A[row * {{K}}u + k] * B[col * {{K}}u + k];
    }
    C[row * {{N}}u + col] = total;
}
"#;

/// Shared-memory tiles; requires the tile size to divide M, K and N.
pub const TILED: &str = r#"{{enable}}
@group(0) @binding(0) var<storage, read> A: array<{{precision}}>;
@group(0) @binding(1) var<storage, read> B: array<{{precision}}>;
@group(0) @binding(2) var<storage, read_write> C: array<{{precision}}>;
var<workgroup> As: array<{{precision}}, {{tileElems}}>;
var<workgroup> Bs: array<{{precision}}, {{tileElems}}>;

@compute @workgroup_size({{workgroupSize}})
fn main(
    @builtin(local_invocation_index) localIdx: u32,
    @builtin(workgroup_id) groupID: vec3<u32>) {
    let loadRow = localIdx / {{tileSize}}u;
    let loadCol = localIdx % {{tileSize}}u;
    let row = groupID.x * {{tileSize}}u + loadRow;
    let col = groupID.y * {{tileSize}}u + loadCol;
    var total: {{precision}} = 0.0;
    for (var tile = 0u; tile < ({{K}}u + {{tileSize}}u - 1u) / {{tileSize}}u; tile = tile + 1u) {
        let aCol = tile * {{tileSize}}u + loadCol;
        let bCol = tile * {{tileSize}}u + loadRow;
        As[loadRow * {{tileSize}}u + loadCol] = A[row * {{K}}u + aCol];
        Bs[loadCol * {{tileSize}}u + loadRow] = B[col * {{K}}u + bCol];
        workgroupBarrier(); // sync: tile-loaded
        for (var k = 0u; k < {{tileSize}}u; k = k + 1u) {
            total += As[loadRow * {{tileSize}}u + k] * Bs[loadCol * {{tileSize}}u + k];
        }
        workgroupBarrier(); // sync: tile-consumed
    }
    C[row * {{N}}u + col] = total;
}
"#;

/// Shared-memory tiles with loads scaled by an in-bounds mask. Indices are
/// clamped so masked-off lanes still read a valid element.
pub const TILED_MASKED: &str = r#"{{enable}}
@group(0) @binding(0) var<storage, read> A: array<{{precision}}>;
@group(0) @binding(1) var<storage, read> B: array<{{precision}}>;
@group(0) @binding(2) var<storage, read_write> C: array<{{precision}}>;
var<workgroup> As: array<{{precision}}, {{tileElems}}>;
var<workgroup> Bs: array<{{precision}}, {{tileElems}}>;

@compute @workgroup_size({{workgroupSize}})
fn main(
    @builtin(local_invocation_index) localIdx: u32,
    @builtin(workgroup_id) groupID: vec3<u32>) {
    let loadRow = localIdx / {{tileSize}}u;
    let loadCol = localIdx % {{tileSize}}u;
    let row = groupID.x * {{tileSize}}u + loadRow;
    let col = groupID.y * {{tileSize}}u + loadCol;
    var total: {{precision}} = 0.0;
    for (var tile = 0u; tile < ({{K}}u + {{tileSize}}u - 1u) / {{tileSize}}u; tile = tile + 1u) {
        let aCol = tile * {{tileSize}}u + loadCol;
        let bCol = tile * {{tileSize}}u + loadRow;
        As[loadRow * {{tileSize}}u + loadCol] =
            A[min(row, {{M}}u - 1u) * {{K}}u + min(aCol, {{K}}u - 1u)]
            * {{precision}}(row < {{M}}u && aCol < {{K}}u);
        Bs[loadCol * {{tileSize}}u + loadRow] =
            B[min(col, {{N}}u - 1u) * {{K}}u + min(bCol, {{K}}u - 1u)]
            * {{precision}}(col < {{N}}u && bCol < {{K}}u);
        workgroupBarrier(); // sync: tile-loaded
        for (var k = 0u; k < {{tileSize}}u; k = k + 1u) {
            total += As[loadRow * {{tileSize}}u + k] * Bs[loadCol * {{tileSize}}u + k];
        }
        workgroupBarrier(); // sync: tile-consumed
    }
    if (row < {{M}}u && col < {{N}}u) {
        C[row * {{N}}u + col] = total;
    }
}
"#;

/// 1D register blocking.
///
/// Each workgroup computes a BM x BN block of C. A lane owns TM consecutive
/// rows of one column of that block and keeps their partial sums in
/// `threadResults`. The K loop stages a BM x BK slice of A and a BN x BK slice
/// of B (B is stored transposed) in workgroup memory; lanes stride over the
/// slices so any block shape is loaded completely. Each element of the B tile
/// read in the inner loop feeds TM accumulations.
pub const BLOCK_TILED: &str = r#"{{enable}}
@group(0) @binding(0) var<storage, read> A: array<{{precision}}>;
@group(0) @binding(1) var<storage, read> B: array<{{precision}}>;
@group(0) @binding(2) var<storage, read_write> C: array<{{precision}}>;
var<workgroup> tileA: array<{{precision}}, {{aTileElems}}>;
var<workgroup> tileB: array<{{precision}}, {{bTileElems}}>;

@compute @workgroup_size({{workgroupSize}})
fn main(
    @builtin(local_invocation_index) localIdx: u32,
    @builtin(workgroup_id) groupID: vec3<u32>) {
    var threadResults: array<{{precision}}, {{TM}}>;

    let blockRow = groupID.x * {{BM}}u;
    let blockCol = groupID.y * {{BN}}u;
    let threadRow = localIdx / {{BN}}u;
    let threadCol = localIdx % {{BN}}u;

    for (var bkIdx = 0u; bkIdx < {{K}}u; bkIdx = bkIdx + {{BK}}u) {
        for (var i = localIdx; i < {{aTileElems}}u; i = i + {{numThreads}}u) {
            let aRow = blockRow + i / {{BK}}u;
            let aCol = bkIdx + i % {{BK}}u;
            tileA[i] = A[min(aRow, {{M}}u - 1u) * {{K}}u + min(aCol, {{K}}u - 1u)]
                * {{precision}}(aRow < {{M}}u && aCol < {{K}}u);
        }
        for (var i = localIdx; i < {{bTileElems}}u; i = i + {{numThreads}}u) {
            let bRow = blockCol + i / {{BK}}u;
            let bCol = bkIdx + i % {{BK}}u;
            tileB[i] = B[min(bRow, {{N}}u - 1u) * {{K}}u + min(bCol, {{K}}u - 1u)]
                * {{precision}}(bRow < {{N}}u && bCol < {{K}}u);
        }
        workgroupBarrier(); // sync: tile-loaded

        for (var dotIdx = 0u; dotIdx < {{BK}}u; dotIdx = dotIdx + 1u) {
            let tmp = tileB[threadCol * {{BK}}u + dotIdx];
            for (var resIdx = 0u; resIdx < {{TM}}u; resIdx = resIdx + 1u) {
                threadResults[resIdx] += tileA[(threadRow * {{TM}}u + resIdx) * {{BK}}u + dotIdx] * tmp;
            }
        }
        workgroupBarrier(); // sync: tile-consumed
    }

    for (var resIdx = 0u; resIdx < {{TM}}u; resIdx = resIdx + 1u) {
        let innerRow = threadRow * {{TM}}u + resIdx;
        let outRow = blockRow + innerRow;
        let outCol = blockCol + threadCol;
        if (innerRow < {{BM}}u && threadCol < {{BN}}u && outRow < {{M}}u && outCol < {{N}}u) {
            C[outRow * {{N}}u + outCol] = threadResults[resIdx];
        }
    }
}
"#;

#[cfg(test)]
mod tests {
    use crate::config::{MatmulProblem, Precision, ProblemPreset, Variant};
    use crate::matmul::MatmulKernel;
    use crate::registry::KernelRegistry;
    use naga::front::wgsl;

    fn validate_wgsl(source: &str) -> Result<(), String> {
        let module = wgsl::parse_str(source).map_err(|e| e.emit_to_string(source))?;
        let mut validator = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        );
        validator.validate(&module).map_err(|e| format!("{e:?}"))?;
        Ok(())
    }

    fn problems() -> Vec<MatmulProblem> {
        vec![
            ProblemPreset::Tiny.problem(),
            ProblemPreset::Small.problem(),
            ProblemPreset::Large.problem(),
            MatmulProblem::new(17, 33, 9),
            MatmulProblem::new(100, 70, 130),
            MatmulProblem::new(37, 21, 19),
        ]
    }

    #[test]
    fn every_rendered_kernel_is_valid_wgsl() {
        let registry = KernelRegistry::with_default_kernels();
        let mut failures = Vec::new();
        let mut rendered = 0;

        for problem in problems() {
            for kernel in registry.kernels() {
                let mut configs = kernel.candidates(problem);
                configs.push(kernel.default_config(problem));
                for config in configs {
                    let source = kernel.render(&config).unwrap();
                    rendered += 1;
                    if let Err(err) = validate_wgsl(source.code.source()) {
                        failures.push(format!(
                            "{} {}x{}x{} {:?}: {err}",
                            kernel.name(),
                            problem.m,
                            problem.k,
                            problem.n,
                            config.tiling
                        ));
                    }
                }
            }
        }

        assert!(rendered > 100);
        assert!(failures.is_empty(), "{}", failures.join("\n"));
    }

    #[test]
    fn masked_and_unmasked_tiled_sources_both_validate() {
        let registry = KernelRegistry::with_default_kernels();
        let tiled = registry.find(Variant::Tiled).unwrap();
        let exact = tiled.render(&tiled.default_config(ProblemPreset::Small.problem())).unwrap();
        let ragged = tiled.render(&tiled.default_config(MatmulProblem::new(17, 33, 9))).unwrap();
        assert_ne!(exact.code.source(), ragged.code.source());
        validate_wgsl(exact.code.source()).unwrap();
        validate_wgsl(ragged.code.source()).unwrap();
    }

    #[test]
    fn block_tiled_store_is_guarded_not_scaled() {
        let registry = KernelRegistry::with_default_kernels();
        let blocked = registry.find(Variant::BlockTiled).unwrap();
        let source = blocked
            .render(&blocked.default_config(MatmulProblem::new(37, 21, 19)))
            .unwrap();
        let store = source
            .code
            .source()
            .lines()
            .find(|line| line.trim_start().starts_with("C["))
            .unwrap();
        assert_eq!(store.trim(), "C[outRow * 19u + outCol] = threadResults[resIdx];");
        assert!(!source.code.source().contains("inBounds"));
    }

    #[test]
    fn f16_sources_differ_from_validated_f32_only_in_element_type() {
        let registry = KernelRegistry::with_default_kernels();
        for problem in problems() {
            for kernel in registry.kernels() {
                let config32 = kernel.default_config(problem);
                let config16 = kernel.default_config(problem.with_precision(Precision::F16));
                let source32 = kernel.render(&config32).unwrap();
                let source16 = kernel.render(&config16).unwrap();

                assert!(source16.code.source().starts_with("enable f16;"));
                let widened = source16
                    .code
                    .source()
                    .replacen("enable f16;", "", 1)
                    .replace("f16", "f32");
                assert_eq!(widened, source32.code.source(), "{}", kernel.name());
            }
        }
    }
}
