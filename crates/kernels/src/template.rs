//! Shader template engine.
//!
//! Templates are WGSL text with `{{name}}` placeholders. Rendering is a pure
//! function of the template and a parameter map: identical inputs always
//! produce byte-identical source, and every placeholder must be resolved.

use crate::config::{KernelConfig, Shape, Tiling};
use crate::error::ConfigError;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Rendered kernel source plus the workgroup shape it was specialized for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderCode {
    source: Arc<str>,
    workgroup: Shape,
}

impl ShaderCode {
    pub fn new(source: impl Into<Arc<str>>, workgroup: Shape) -> Self {
        Self {
            source: source.into(),
            workgroup,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn workgroup(&self) -> Shape {
        self.workgroup
    }
}

/// Placeholder values keyed by name. Ordered so debug output is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateParams {
    values: BTreeMap<&'static str, String>,
}

impl TemplateParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: &'static str, value: impl ToString) -> Self {
        self.values.insert(name, value.to_string());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl KernelConfig {
    /// Stringified parameters for every placeholder a variant template uses.
    pub fn template_params(&self) -> TemplateParams {
        let p = &self.problem;
        let params = TemplateParams::new()
            .set("enable", p.precision.wgsl_enable())
            .set("precision", p.precision.wgsl_type())
            .set("workgroupSize", self.workgroup.wgsl())
            .set("M", p.m)
            .set("K", p.k)
            .set("N", p.n);

        match self.tiling {
            Tiling::Naive => params,
            Tiling::SharedMemory { tile_size, .. } => params
                .set("tileSize", tile_size)
                .set("tileElems", tile_size as u64 * tile_size as u64),
            Tiling::RegisterBlocked { bm, bn, bk, tm } => params
                .set("BM", bm)
                .set("BN", bn)
                .set("BK", bk)
                .set("TM", tm)
                .set("aTileElems", bm as u64 * bk as u64)
                .set("bTileElems", bn as u64 * bk as u64)
                .set("numThreads", self.workgroup.volume()),
        }
    }
}

/// Substitute every `{{name}}` in `template` with its value from `params`.
pub fn generate(
    template: &str,
    params: &TemplateParams,
    workgroup: Shape,
) -> Result<ShaderCode, ConfigError> {
    let mut out = String::with_capacity(template.len() + 64);
    let mut rest = template;
    let mut consumed = 0usize;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        let close = after_open
            .find("}}")
            .ok_or(ConfigError::MalformedPlaceholder {
                offset: consumed + open,
            })?;
        let name = after_open[..close].trim();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(ConfigError::MalformedPlaceholder {
                offset: consumed + open,
            });
        }
        let value = params
            .get(name)
            .ok_or_else(|| ConfigError::UnresolvedPlaceholder {
                name: name.to_string(),
            })?;
        out.push_str(value);

        let advance = open + 2 + close + 2;
        consumed += advance;
        rest = &rest[advance..];
    }
    out.push_str(rest);

    Ok(ShaderCode::new(out, workgroup))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Masking, MatmulProblem};

    #[test]
    fn substitutes_all_placeholders() {
        let params = TemplateParams::new().set("M", 16).set("precision", "f32");
        let code = generate("var x: {{precision}} = {{ M }};", &params, Shape::linear(1)).unwrap();
        assert_eq!(code.source(), "var x: f32 = 16;");
    }

    #[test]
    fn unresolved_placeholder_is_an_error() {
        let params = TemplateParams::new().set("M", 16);
        let err = generate("{{M}} {{K}}", &params, Shape::linear(1)).unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnresolvedPlaceholder {
                name: "K".to_string()
            }
        );
        assert!(err.to_string().contains("{{K}}"));
    }

    #[test]
    fn unterminated_placeholder_is_malformed() {
        let err = generate("abc {{M", &TemplateParams::new(), Shape::linear(1)).unwrap_err();
        assert_eq!(err, ConfigError::MalformedPlaceholder { offset: 4 });
    }

    #[test]
    fn array_lengths_are_precomputed() {
        let problem = MatmulProblem::new(64, 64, 64);
        let tiled = KernelConfig::tiled(problem, 16, Masking::Auto).template_params();
        assert_eq!(tiled.get("tileElems"), Some("256"));

        let blocked = KernelConfig::block_tiled(problem, 64, 32, 8, 8).template_params();
        assert_eq!(blocked.get("aTileElems"), Some("512"));
        assert_eq!(blocked.get("bTileElems"), Some("256"));
        assert_eq!(blocked.get("numThreads"), Some("256"));
    }

    #[test]
    fn generation_is_deterministic() {
        let config = KernelConfig::tiled(MatmulProblem::new(17, 33, 9), 16, Masking::Auto);
        let template = "{{enable}}{{precision}} {{M}} {{K}} {{N}} {{tileSize}} {{workgroupSize}}";
        let first = generate(template, &config.template_params(), config.workgroup).unwrap();
        let second = generate(template, &config.template_params(), config.workgroup).unwrap();
        assert_eq!(first.source().as_bytes(), second.source().as_bytes());
        assert_eq!(first.source(), "f32 17 33 9 16 256, 1, 1");
    }
}
