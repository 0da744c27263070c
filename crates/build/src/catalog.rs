//! Filter catalog loading
//!
//! Combines a validated manifest with the shader sources it references. Every
//! shader is checked with naga before it is accepted, so a catalog returned from
//! here can be embedded into the engine without further checks.

use crate::manifest::FilterManifest;
use crate::manifest::FilterSpec;
use crate::minify::{minify_wgsl, validate_wgsl};

/// A filter whose manifest entry and shader have both been validated
#[derive(Debug, Clone)]
pub struct CatalogFilter {
    /// Manifest entry
    pub spec: FilterSpec,
    /// WGSL shader source code
    pub shader: String,
}

/// A complete validated filter catalog
#[derive(Debug, Clone)]
pub struct Catalog {
    /// Filters in manifest order
    pub filters: Vec<CatalogFilter>,
}

impl Catalog {
    /// Builds a catalog from a parsed manifest
    ///
    /// # Arguments
    /// * `manifest` - The parsed manifest
    /// * `load_shader_file` - Function to load shader source files by manifest path
    /// * `minify` - Whether to minify the WGSL code
    pub fn from_manifest(
        manifest: FilterManifest,
        load_shader_file: impl Fn(&str) -> Result<String, std::io::Error>,
        minify: bool,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        manifest.validate()?;

        let filters = manifest
            .filters
            .into_iter()
            .map(|spec| -> Result<CatalogFilter, Box<dyn std::error::Error>> {
                let code = load_shader_file(&spec.file)?;
                let overrides = spec.override_names();
                validate_wgsl(&code, &overrides).map_err(|e| format!("Shader '{}' of filter '{}' is invalid: {e}", spec.file, spec.id))?;
                if !minify {
                    return Ok(CatalogFilter { spec, shader: code });
                }

                let shader = minify_wgsl(&code).map_err(|e| format!("Failed to minify shader '{}': {e}", spec.file))?;
                validate_wgsl(&shader, &overrides).map_err(|e| format!("Minified shader '{}' of filter '{}' is invalid: {e}", spec.file, spec.id))?;
                Ok(CatalogFilter { spec, shader })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { filters })
    }

    /// Looks up a filter by identifier
    pub fn get(&self, id: &str) -> Option<&CatalogFilter> {
        self.filters.iter().find(|f| f.spec.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
filters:
  - id: invert
    file: invert.wgsl
    inputs: [image]
    region:
      rule: identity
"#;

    const INVERT: &str = r#"
@group(0) @binding(2) var output: texture_storage_2d<rgba32float, write>;
@group(0) @binding(3) var input0: texture_2d<f32>;

@compute @workgroup_size(8, 8, 1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let c = textureLoad(input0, vec2<i32>(id.xy), 0);
    textureStore(output, vec2<i32>(id.xy), vec4<f32>(c.a - c.rgb, c.a));
}
"#;

    #[test]
    fn test_catalog_from_manifest() {
        let manifest = FilterManifest::from_yaml(MANIFEST).unwrap();
        let catalog = Catalog::from_manifest(
            manifest,
            |file| {
                assert_eq!(file, "invert.wgsl");
                Ok(INVERT.to_string())
            },
            false,
        )
        .unwrap();

        assert_eq!(catalog.filters.len(), 1);
        assert_eq!(catalog.get("invert").unwrap().shader, INVERT);
        assert!(catalog.get("brightness").is_none());
    }

    #[test]
    fn test_minified_catalog_stays_valid() {
        let manifest = FilterManifest::from_yaml(MANIFEST).unwrap();
        let catalog = Catalog::from_manifest(manifest, |_| Ok(format!("// Inverts input 0.\n{INVERT}")), true).unwrap();

        let shader = &catalog.get("invert").unwrap().shader;
        assert!(!shader.contains("//"));
        validate_wgsl(shader, &[]).unwrap();
    }

    #[test]
    fn test_builtin_catalog_minifies_to_valid_shaders() {
        let manifest = concat!(env!("CARGO_MANIFEST_DIR"), "/../../wgsl/filters.yaml");
        let catalog = crate::load_catalog(manifest, true).unwrap();

        assert!(!catalog.filters.is_empty());
        for filter in &catalog.filters {
            validate_wgsl(&filter.shader, &filter.spec.override_names()).unwrap_or_else(|e| panic!("{}: {e}", filter.spec.id));
            assert!(!filter.shader.contains("//"), "{}", filter.spec.id);
        }
    }

    #[test]
    fn test_catalog_rejects_invalid_shader() {
        let manifest = FilterManifest::from_yaml(MANIFEST).unwrap();
        let result = Catalog::from_manifest(manifest, |_| Ok("fn main() {}".to_string()), false);
        let message = result.unwrap_err().to_string();
        assert!(message.contains("invert"), "{message}");
    }

    #[test]
    fn test_catalog_propagates_missing_files() {
        let manifest = FilterManifest::from_yaml(MANIFEST).unwrap();
        let result = Catalog::from_manifest(manifest, |file| Err(std::io::Error::new(std::io::ErrorKind::NotFound, format!("File not found: {file}"))), false);
        assert!(result.is_err());
    }
}
