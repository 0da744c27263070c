//! lazyfilter-wgpu build utilities
//!
//! This crate loads the built-in filter manifest, validates each filter's schema and
//! WGSL shader, and hands the result to the engine's build script, which embeds the
//! catalog into the compiled binary.

mod catalog;
mod minify;

pub mod manifest;

pub use catalog::{Catalog, CatalogFilter};
pub use minify::{FILTER_ENTRY_POINT, FILTER_WORKGROUP_SIZE, ShaderValidationError, minify_wgsl, validate_wgsl};

/// Loads a filter manifest file and all shaders it references
///
/// Shader paths in the manifest are resolved relative to the manifest's directory.
///
/// # Arguments
/// * `manifest_filepath` - Path to the YAML manifest file
/// * `minify` - Whether to minify the WGSL code
///
/// # Returns
/// A validated catalog ready to be embedded
pub fn load_catalog(manifest_filepath: &str, minify: bool) -> Result<Catalog, Box<dyn std::error::Error>> {
    let dir = std::path::Path::new(manifest_filepath).parent().ok_or("Manifest path has no parent directory")?;
    let manifest = manifest::FilterManifest::from_file(manifest_filepath)?;
    Catalog::from_manifest(
        manifest,
        |filename: &str| {
            let path = dir.join(filename);
            std::fs::read_to_string(&path).inspect_err(|e| {
                eprintln!("Error reading file {path:?}: {e}");
            })
        },
        minify,
    )
}
