//! Filter definitions and the filter catalog
//!
//! A [`FilterDefinition`] is everything the compiler needs to schedule a filter: its
//! input slots, its parameter schema and the rule relating output regions to input
//! regions. The built-in definitions are generated at build time from
//! `wgsl/filters.yaml`; callers may register more at runtime.

use crate::error::RenderError;
use crate::graph::{FilterNode, ParamValue};
use crate::region::Region;
use std::collections::HashMap;
use std::sync::RwLock;

/// Kind of value a parameter accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterKind {
    Scalar,
    Vector2,
    Vector4,
    Color,
}

impl ParameterKind {
    pub fn components(&self) -> usize {
        match self {
            ParameterKind::Scalar => 1,
            ParameterKind::Vector2 => 2,
            ParameterKind::Vector4 | ParameterKind::Color => 4,
        }
    }

    /// Whether a node value may be bound to a parameter of this kind
    ///
    /// Colors and four-component vectors are interchangeable.
    pub fn accepts(&self, value: &ParamValue) -> bool {
        matches!(
            (self, value),
            (ParameterKind::Scalar, ParamValue::Scalar(_))
                | (ParameterKind::Vector2, ParamValue::Vector2(_))
                | (ParameterKind::Vector4 | ParameterKind::Color, ParamValue::Vector4(_) | ParamValue::Color(_))
        )
    }
}

/// One entry of a filter's parameter schema
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterSpec {
    pub key: &'static str,
    pub kind: ParameterKind,
    pub default: &'static [f32],
    /// Override constant fed by this parameter; such parameters select a pipeline variant
    pub compile_time: Option<&'static str>,
}

/// How a filter relates its output region to its input regions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionRule {
    Identity,
    Generator,
    Expand { parameter: &'static str },
    Offset { parameter: &'static str },
    Crop { parameter: &'static str },
    Union,
}

/// Static description of a filter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterDefinition {
    pub id: &'static str,
    pub description: &'static str,
    /// Input slot names, bound in order
    pub inputs: &'static [&'static str],
    pub parameters: &'static [ParameterSpec],
    pub region: RegionRule,
}

/// A built-in filter with its embedded WGSL
#[derive(Debug, Clone, Copy)]
pub struct BuiltinFilter {
    pub definition: FilterDefinition,
    pub shader: &'static str,
}

mod builtin {
    use super::*;

    include!(concat!(env!("OUT_DIR"), "/filters.rs"));
}

/// The filters compiled into this crate
pub fn builtin_filters() -> &'static [BuiltinFilter] {
    builtin::BUILTIN_FILTERS
}

/// Parameter values of one node after validation, in schema order
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedParams {
    values: Vec<(&'static str, [f32; 4])>,
}

impl ResolvedParams {
    /// Value of a schema parameter, zero-padded to four components
    pub fn get(&self, key: &str) -> [f32; 4] {
        self.values.iter().find(|(k, _)| *k == key).map(|(_, v)| *v).unwrap_or_default()
    }
}

fn round_to_i32(value: f32) -> i32 {
    value.round().clamp(i32::MIN as f32, i32::MAX as f32) as i32
}

/// Whole-pixel radius used both for the override constant and the region of interest
pub(crate) fn radius_of(value: f32) -> u32 {
    value.round().clamp(0.0, u16::MAX as f32) as u32
}

impl FilterDefinition {
    pub fn parameter(&self, key: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.key == key)
    }

    pub fn is_generator(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Checks a node's parameters against the schema and fills in defaults
    ///
    /// Keys naming an input slot must hold image references; every other key must be
    /// a schema parameter with a value of the right kind.
    pub fn resolve_params(&self, node: &FilterNode) -> Result<ResolvedParams, RenderError> {
        let invalid = |key: &str, reason: String| RenderError::InvalidParameter {
            filter: self.id.to_string(),
            key: key.to_string(),
            reason,
        };

        for (key, value) in node.params() {
            if self.inputs.contains(&key.as_str()) {
                if !matches!(value, ParamValue::Image(_)) {
                    return Err(invalid(key, format!("input slot expects an image, got {}", value.kind_name())));
                }
                continue;
            }
            let Some(spec) = self.parameter(key) else {
                return Err(invalid(key, "not part of the filter's schema".to_string()));
            };
            if !spec.kind.accepts(value) {
                return Err(invalid(key, format!("expected {:?}, got {}", spec.kind, value.kind_name())));
            }
        }

        let values = self
            .parameters
            .iter()
            .map(|spec| {
                let source = node.param(spec.key).and_then(|v| v.components()).unwrap_or(spec.default);
                let mut value = [0.0f32; 4];
                for (slot, v) in value.iter_mut().zip(source) {
                    *slot = *v;
                }
                (spec.key, value)
            })
            .collect();

        Ok(ResolvedParams { values })
    }

    /// Override constants for the pipeline variant selected by these parameters
    pub fn pipeline_constants(&self, params: &ResolvedParams) -> Vec<(String, f64)> {
        self.parameters
            .iter()
            .filter_map(|spec| spec.compile_time.map(|name| (name.to_string(), radius_of(params.get(spec.key)[0]) as f64)))
            .collect()
    }

    /// Per-dispatch uniform data: one vec4 per runtime parameter, in schema order
    ///
    /// A translation parameter is rounded to whole pixels here, so the shader shifts
    /// by exactly the amount the region computations assume.
    pub fn uniform_data(&self, params: &ResolvedParams) -> Vec<[f32; 4]> {
        self.parameters
            .iter()
            .filter(|spec| spec.compile_time.is_none())
            .map(|spec| {
                let value = params.get(spec.key);
                match self.region {
                    RegionRule::Offset { parameter } if parameter == spec.key => value.map(|v| round_to_i32(v) as f32),
                    _ => value,
                }
            })
            .collect()
    }

    /// Region each input must provide so the filter can produce `output`
    pub fn input_region(&self, params: &ResolvedParams, output: Region) -> Region {
        match self.region {
            RegionRule::Identity | RegionRule::Union | RegionRule::Crop { .. } | RegionRule::Generator => output,
            RegionRule::Expand { parameter } => output.expanded(radius_of(params.get(parameter)[0])),
            RegionRule::Offset { parameter } => {
                let [dx, dy, ..] = params.get(parameter);
                output.translated(-round_to_i32(dx), -round_to_i32(dy))
            }
        }
    }

    /// Pixels the filter can produce given its inputs' extents
    ///
    /// [`Region::INFINITE`] means the output is unbounded.
    pub fn extent(&self, params: &ResolvedParams, inputs: &[Region]) -> Region {
        let first = inputs.first().copied().unwrap_or(Region::INFINITE);
        match self.region {
            RegionRule::Generator => Region::INFINITE,
            RegionRule::Identity => first,
            RegionRule::Expand { parameter } => first.expanded(radius_of(params.get(parameter)[0])),
            RegionRule::Offset { parameter } => {
                let [dx, dy, ..] = params.get(parameter);
                first.translated(round_to_i32(dx), round_to_i32(dy))
            }
            RegionRule::Crop { parameter } => {
                let [x, y, w, h] = params.get(parameter);
                // Pixels whose centers fall inside the rectangle.
                let left = (x - 0.5).ceil() as i64;
                let top = (y - 0.5).ceil() as i64;
                let right = ((x + w.max(0.0)) - 0.5).ceil() as i64;
                let bottom = ((y + h.max(0.0)) - 0.5).ceil() as i64;
                let rect = Region::new(left as i32, top as i32, (right - left).max(0) as u32, (bottom - top).max(0) as u32);
                first.intersection(&rect).unwrap_or(Region::new(rect.x, rect.y, 0, 0))
            }
            RegionRule::Union => inputs.iter().fold(Region::new(0, 0, 0, 0), |acc, r| acc.union(r)),
        }
    }
}

/// Process-wide table of filter definitions
#[derive(Debug, Default)]
pub struct FilterCatalog {
    filters: RwLock<HashMap<String, FilterDefinition>>,
}

impl FilterCatalog {
    /// An empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// A catalog holding every built-in filter
    pub fn with_builtins() -> Self {
        let catalog = Self::new();
        for filter in builtin_filters() {
            catalog.register(filter.definition);
        }
        catalog
    }

    /// Adds or replaces a definition, returning the replaced one
    pub fn register(&self, definition: FilterDefinition) -> Option<FilterDefinition> {
        self.filters.write().unwrap_or_else(|e| e.into_inner()).insert(definition.id.to_string(), definition)
    }

    pub fn get(&self, id: &str) -> Option<FilterDefinition> {
        self.filters.read().unwrap_or_else(|e| e.into_inner()).get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.filters.read().unwrap_or_else(|e| e.into_inner()).contains_key(id)
    }

    /// Registered identifiers, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids = self.filters.read().unwrap_or_else(|e| e.into_inner()).keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeId;

    fn definition(id: &str) -> FilterDefinition {
        builtin_filters().iter().find(|f| f.definition.id == id).unwrap().definition
    }

    #[test]
    fn test_builtins_are_registered() {
        let catalog = FilterCatalog::with_builtins();
        for id in ["constant_color", "checkerboard", "brightness", "box_blur", "offset", "crop", "source_over"] {
            assert!(catalog.contains(id), "missing builtin {id}");
        }
        assert!(catalog.get("brightness").unwrap().parameter("amount").is_some());
        assert!(catalog.get("constant_color").unwrap().is_generator());
    }

    #[test]
    fn test_resolve_params_fills_defaults() {
        let brightness = definition("brightness");
        let params = brightness.resolve_params(&FilterNode::new("brightness")).unwrap();
        assert_eq!(params.get("amount"), [0.0; 4]);

        let params = brightness.resolve_params(&FilterNode::new("brightness").with_param("amount", 0.5f32)).unwrap();
        assert_eq!(brightness.uniform_data(&params), vec![[0.5, 0.0, 0.0, 0.0]]);
    }

    #[test]
    fn test_resolve_params_rejects_unknown_keys_and_kinds() {
        let brightness = definition("brightness");
        let unknown = FilterNode::new("brightness").with_param("radius", 2.0f32);
        assert!(matches!(brightness.resolve_params(&unknown), Err(RenderError::InvalidParameter { key, .. }) if key == "radius"));

        let wrong_kind = FilterNode::new("brightness").with_param("amount", [1.0f32, 2.0]);
        assert!(matches!(brightness.resolve_params(&wrong_kind), Err(RenderError::InvalidParameter { .. })));

        let over = definition("source_over");
        let slot = FilterNode::new("source_over").with_param("background", 1.0f32);
        assert!(matches!(over.resolve_params(&slot), Err(RenderError::InvalidParameter { .. })));
        let slot = FilterNode::new("source_over").with_param("background", NodeId::from_index(0));
        assert!(over.resolve_params(&slot).is_ok());
    }

    #[test]
    fn test_compile_time_parameters_split_from_uniforms() {
        let blur = definition("box_blur");
        let params = blur.resolve_params(&FilterNode::new("box_blur").with_param("radius", 2.6f32)).unwrap();
        assert_eq!(blur.pipeline_constants(&params), vec![("RADIUS".to_string(), 3.0)]);
        assert!(blur.uniform_data(&params).is_empty());
    }

    #[test]
    fn test_fractional_offset_shifts_pixels_and_extent_alike() {
        let offset = definition("offset");
        let image = Region::new(0, 0, 1, 1);
        for (dx, shift) in [(0.5f32, 1), (2.5, 3), (-0.5, -1), (1.4, 1)] {
            let params = offset.resolve_params(&FilterNode::new("offset").with_param("offset", [dx, 0.0])).unwrap();
            let extent = offset.extent(&params, &[image]);
            assert_eq!(extent, Region::new(shift, 0, 1, 1), "offset {dx}");
            assert_eq!(offset.uniform_data(&params)[0][0], shift as f32, "offset {dx}");
            assert_eq!(offset.input_region(&params, extent), image, "offset {dx}");
        }
    }

    #[test]
    fn test_region_rules() {
        let output = Region::new(0, 0, 4, 4);

        let blur = definition("box_blur");
        let params = blur.resolve_params(&FilterNode::new("box_blur").with_param("radius", 2.0f32)).unwrap();
        assert_eq!(blur.input_region(&params, output), Region::new(-2, -2, 8, 8));
        assert_eq!(blur.extent(&params, &[output]), Region::new(-2, -2, 8, 8));

        let offset = definition("offset");
        let params = offset.resolve_params(&FilterNode::new("offset").with_param("offset", [3.0f32, -1.0])).unwrap();
        assert_eq!(offset.input_region(&params, output), Region::new(-3, 1, 4, 4));
        assert_eq!(offset.extent(&params, &[output]), Region::new(3, -1, 4, 4));

        let crop = definition("crop");
        let params = crop.resolve_params(&FilterNode::new("crop").with_param("rect", [1.0f32, 1.0, 2.0, 2.0])).unwrap();
        assert_eq!(crop.extent(&params, &[Region::INFINITE]), Region::new(1, 1, 2, 2));
        assert_eq!(crop.extent(&params, &[Region::new(2, 2, 8, 8)]), Region::new(2, 2, 1, 1));

        let over = definition("source_over");
        let params = over.resolve_params(&FilterNode::new("source_over")).unwrap();
        assert_eq!(over.extent(&params, &[output, Region::new(2, 2, 4, 4)]), Region::new(0, 0, 6, 6));

        let color = definition("constant_color");
        let params = color.resolve_params(&FilterNode::new("constant_color")).unwrap();
        assert!(color.extent(&params, &[]).is_infinite());
    }
}
