//! Filter Manifest Parser
//!
//! This module provides parsing and validation for the YAML manifest that lists the
//! built-in filters. Each entry names a WGSL compute shader, the filter's input slots,
//! its parameter schema and the rule used to derive its region of interest.

use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;

/// Maximum number of image inputs a single filter may declare
pub const MAX_FILTER_INPUTS: usize = 4;

/// Kind of value a filter parameter accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    /// A single float
    Scalar,
    /// Two floats (points, offsets)
    Vector2,
    /// Four floats (rectangles, matrix rows)
    Vector4,
    /// Four floats interpreted as straight RGBA
    Color,
}

impl ParameterKind {
    /// Number of float components stored for this kind
    pub fn components(&self) -> usize {
        match self {
            ParameterKind::Scalar => 1,
            ParameterKind::Vector2 => 2,
            ParameterKind::Vector4 | ParameterKind::Color => 4,
        }
    }

    /// Name of this kind as written in generated Rust code
    pub fn variant_name(&self) -> &'static str {
        match self {
            ParameterKind::Scalar => "Scalar",
            ParameterKind::Vector2 => "Vector2",
            ParameterKind::Vector4 => "Vector4",
            ParameterKind::Color => "Color",
        }
    }
}

/// A single entry in a filter's parameter schema
#[derive(Debug, Clone, Deserialize)]
pub struct ParameterSpec {
    /// Parameter key used by graph nodes
    pub key: String,
    /// Kind of value accepted
    pub kind: ParameterKind,
    /// Default value, one float per component
    pub default: Vec<f32>,
    /// Name of the WGSL `override` constant this parameter feeds, if any
    ///
    /// Parameters with an override change the compiled pipeline and are part
    /// of the pipeline cache key; all others are packed into the uniform buffer.
    #[serde(default)]
    pub compile_time: Option<String>,
}

/// Rule describing how a filter maps output regions to input regions
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum RegionSpec {
    /// Output pixel depends only on the same input pixel
    Identity,
    /// No inputs, unbounded output
    Generator,
    /// Input region grows by the named scalar parameter on every side
    Expand { parameter: String },
    /// Output is the input translated by the named vector2 parameter
    Offset { parameter: String },
    /// Output is the input clipped to the named vector4 rectangle
    Crop { parameter: String },
    /// Output extent is the union of all input extents
    Union,
}

impl RegionSpec {
    /// The parameter referenced by this rule and the kind it must have
    pub fn parameter(&self) -> Option<(&str, ParameterKind)> {
        match self {
            RegionSpec::Expand { parameter } => Some((parameter, ParameterKind::Scalar)),
            RegionSpec::Offset { parameter } => Some((parameter, ParameterKind::Vector2)),
            RegionSpec::Crop { parameter } => Some((parameter, ParameterKind::Vector4)),
            RegionSpec::Identity | RegionSpec::Generator | RegionSpec::Union => None,
        }
    }
}

/// A single filter declared in the manifest
#[derive(Debug, Clone, Deserialize)]
pub struct FilterSpec {
    /// Filter identifier
    pub id: String,
    /// Shader file path relative to the manifest
    pub file: String,
    /// Optional description
    #[serde(default)]
    pub description: Option<String>,
    /// Named input slots, bound in order after the output texture
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Parameter schema
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    /// Region rule
    pub region: RegionSpec,
}

/// Raw filter manifest as parsed from YAML
#[derive(Debug, Clone, Deserialize)]
pub struct FilterManifest {
    /// Declared filters, in catalog order
    pub filters: Vec<FilterSpec>,
}

impl FilterManifest {
    /// Parses a filter manifest from YAML content
    ///
    /// # Arguments
    /// * `yaml_content` - YAML string containing the manifest
    pub fn from_yaml(yaml_content: &str) -> Result<Self, serde_norway::Error> {
        serde_norway::from_str(yaml_content)
    }

    /// Parses a filter manifest from a YAML file
    ///
    /// # Arguments
    /// * `path` - Path to the YAML manifest file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_yaml(&content)?)
    }

    /// Validates the manifest for structural correctness
    ///
    /// Checks identifiers, input slot counts, parameter schemas and region rules.
    /// Shader sources are validated separately once they are loaded.
    pub fn validate(&self) -> Result<(), ManifestValidationError> {
        if self.filters.is_empty() {
            return Err(ManifestValidationError::NoFilters);
        }

        let mut seen_ids = HashSet::new();
        for filter in &self.filters {
            if filter.id.is_empty() {
                return Err(ManifestValidationError::EmptyId);
            }
            if !seen_ids.insert(filter.id.as_str()) {
                return Err(ManifestValidationError::DuplicateFilter(filter.id.clone()));
            }
            filter.validate()?;
        }

        Ok(())
    }
}

impl FilterSpec {
    fn validate(&self) -> Result<(), ManifestValidationError> {
        let id = &self.id;

        match (&self.region, self.inputs.is_empty()) {
            (RegionSpec::Generator, false) => return Err(ManifestValidationError::GeneratorWithInputs(id.clone())),
            (RegionSpec::Generator, true) => {}
            (_, true) => return Err(ManifestValidationError::MissingInputs(id.clone())),
            _ => {}
        }
        if self.inputs.len() > MAX_FILTER_INPUTS {
            return Err(ManifestValidationError::TooManyInputs(id.clone(), self.inputs.len()));
        }

        let mut keys = HashSet::new();
        for input in &self.inputs {
            if !keys.insert(input.as_str()) {
                return Err(ManifestValidationError::DuplicateKey(id.clone(), input.clone()));
            }
        }

        for parameter in &self.parameters {
            if !keys.insert(parameter.key.as_str()) {
                return Err(ManifestValidationError::DuplicateKey(id.clone(), parameter.key.clone()));
            }
            if parameter.default.len() != parameter.kind.components() {
                return Err(ManifestValidationError::DefaultArity {
                    filter: id.clone(),
                    key: parameter.key.clone(),
                    expected: parameter.kind.components(),
                    found: parameter.default.len(),
                });
            }
            if parameter.compile_time.is_some() && parameter.kind != ParameterKind::Scalar {
                return Err(ManifestValidationError::CompileTimeNotScalar(id.clone(), parameter.key.clone()));
            }
        }

        if let Some((name, kind)) = self.region.parameter() {
            match self.parameters.iter().find(|p| p.key == name) {
                None => return Err(ManifestValidationError::UnknownRegionParameter(id.clone(), name.to_string())),
                Some(p) if p.kind != kind => return Err(ManifestValidationError::RegionParameterKind(id.clone(), name.to_string())),
                Some(_) => {}
            }
        }

        Ok(())
    }

    /// Names of the `override` constants this filter's shader must declare
    pub fn override_names(&self) -> Vec<&str> {
        self.parameters.iter().filter_map(|p| p.compile_time.as_deref()).collect()
    }
}

/// Errors that can occur during manifest validation
#[derive(Debug, Clone)]
pub enum ManifestValidationError {
    /// The manifest declares no filters
    NoFilters,
    /// A filter has an empty identifier
    EmptyId,
    /// Two filters share an identifier
    DuplicateFilter(String),
    /// A generator declares input slots (filter)
    GeneratorWithInputs(String),
    /// A non-generator declares no input slots (filter)
    MissingInputs(String),
    /// Too many input slots (filter, count)
    TooManyInputs(String, usize),
    /// An input slot or parameter key is declared twice (filter, key)
    DuplicateKey(String, String),
    /// A default value has the wrong number of components
    DefaultArity { filter: String, key: String, expected: usize, found: usize },
    /// Only scalar parameters may feed override constants (filter, key)
    CompileTimeNotScalar(String, String),
    /// A region rule references a parameter that does not exist (filter, parameter)
    UnknownRegionParameter(String, String),
    /// A region rule references a parameter of the wrong kind (filter, parameter)
    RegionParameterKind(String, String),
}

impl fmt::Display for ManifestValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoFilters => write!(f, "Manifest must declare at least one filter"),
            Self::EmptyId => write!(f, "Filter ID cannot be empty"),
            Self::DuplicateFilter(id) => write!(f, "Filter '{id}' is declared more than once"),
            Self::GeneratorWithInputs(id) => write!(f, "Generator filter '{id}' cannot declare inputs"),
            Self::MissingInputs(id) => write!(f, "Filter '{id}' must declare at least one input"),
            Self::TooManyInputs(id, count) => {
                write!(f, "Filter '{id}' declares {count} inputs, at most {MAX_FILTER_INPUTS} are supported")
            }
            Self::DuplicateKey(id, key) => write!(f, "Key '{key}' is declared more than once in filter '{id}'"),
            Self::DefaultArity { filter, key, expected, found } => {
                write!(f, "Default for '{key}' in filter '{filter}' has {found} components, expected {expected}")
            }
            Self::CompileTimeNotScalar(id, key) => {
                write!(f, "Parameter '{key}' in filter '{id}' feeds an override constant but is not a scalar")
            }
            Self::UnknownRegionParameter(id, parameter) => {
                write!(f, "Region rule of filter '{id}' references unknown parameter '{parameter}'")
            }
            Self::RegionParameterKind(id, parameter) => {
                write!(f, "Region rule of filter '{id}' references parameter '{parameter}' of the wrong kind")
            }
        }
    }
}

impl std::error::Error for ManifestValidationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_parsing() {
        let yaml = r#"
filters:
  - id: box_blur
    file: box_blur.wgsl
    description: Box blur
    inputs: [image]
    parameters:
      - key: radius
        kind: scalar
        default: [1.0]
        compile_time: RADIUS
    region:
      rule: expand
      parameter: radius
  - id: constant_color
    file: constant_color.wgsl
    parameters:
      - key: color
        kind: color
        default: [0.0, 0.0, 0.0, 1.0]
    region:
      rule: generator
"#;

        let manifest = FilterManifest::from_yaml(yaml).unwrap();
        assert_eq!(manifest.filters.len(), 2);

        let blur = &manifest.filters[0];
        assert_eq!(blur.id, "box_blur");
        assert_eq!(blur.inputs, vec!["image".to_string()]);
        assert_eq!(blur.region, RegionSpec::Expand { parameter: "radius".to_string() });
        assert_eq!(blur.override_names(), vec!["RADIUS"]);

        let color = &manifest.filters[1];
        assert!(color.inputs.is_empty());
        assert_eq!(color.parameters[0].kind, ParameterKind::Color);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_rejects_generator_with_inputs() {
        let yaml = r#"
filters:
  - id: noise
    file: noise.wgsl
    inputs: [image]
    region:
      rule: generator
"#;

        let manifest = FilterManifest::from_yaml(yaml).unwrap();
        assert!(matches!(manifest.validate(), Err(ManifestValidationError::GeneratorWithInputs(id)) if id == "noise"));
    }

    #[test]
    fn test_rejects_wrong_default_arity() {
        let yaml = r#"
filters:
  - id: tint
    file: tint.wgsl
    inputs: [image]
    parameters:
      - key: color
        kind: color
        default: [1.0, 0.0]
    region:
      rule: identity
"#;

        let manifest = FilterManifest::from_yaml(yaml).unwrap();
        match manifest.validate() {
            Err(ManifestValidationError::DefaultArity { expected, found, .. }) => {
                assert_eq!(expected, 4);
                assert_eq!(found, 2);
            }
            other => panic!("unexpected validation result: {other:?}"),
        }
    }

    #[test]
    fn test_rejects_region_parameter_of_wrong_kind() {
        let yaml = r#"
filters:
  - id: shift
    file: shift.wgsl
    inputs: [image]
    parameters:
      - key: offset
        kind: scalar
        default: [0.0]
    region:
      rule: offset
      parameter: offset
"#;

        let manifest = FilterManifest::from_yaml(yaml).unwrap();
        assert!(matches!(manifest.validate(), Err(ManifestValidationError::RegionParameterKind(_, p)) if p == "offset"));
    }

    #[test]
    fn test_rejects_duplicate_filters_and_keys() {
        let yaml = r#"
filters:
  - id: invert
    file: invert.wgsl
    inputs: [image]
    region:
      rule: identity
  - id: invert
    file: invert.wgsl
    inputs: [image]
    region:
      rule: identity
"#;
        let manifest = FilterManifest::from_yaml(yaml).unwrap();
        assert!(matches!(manifest.validate(), Err(ManifestValidationError::DuplicateFilter(_))));

        let yaml = r#"
filters:
  - id: blend
    file: blend.wgsl
    inputs: [image, amount]
    parameters:
      - key: amount
        kind: scalar
        default: [1.0]
    region:
      rule: union
"#;
        let manifest = FilterManifest::from_yaml(yaml).unwrap();
        assert!(matches!(manifest.validate(), Err(ManifestValidationError::DuplicateKey(_, key)) if key == "amount"));
    }
}
