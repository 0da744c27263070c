//! Build script for lazyfilter-wgpu crate
//!
//! This build script generates Rust code containing the built-in filter catalog.
//! It loads `wgsl/filters.yaml`, validates every filter schema and WGSL shader, and
//! emits a static table of filter definitions with their minified shaders embedded.

use lazyfilter_wgpu_build::{CatalogFilter, load_catalog, manifest::RegionSpec};

/// Generates Rust code for a region rule
fn dump_region_rule(region: &RegionSpec) -> String {
    match region {
        RegionSpec::Identity => "RegionRule::Identity".to_string(),
        RegionSpec::Generator => "RegionRule::Generator".to_string(),
        RegionSpec::Expand { parameter } => format!("RegionRule::Expand {{ parameter: {parameter:?} }}"),
        RegionSpec::Offset { parameter } => format!("RegionRule::Offset {{ parameter: {parameter:?} }}"),
        RegionSpec::Crop { parameter } => format!("RegionRule::Crop {{ parameter: {parameter:?} }}"),
        RegionSpec::Union => "RegionRule::Union".to_string(),
    }
}

/// Generates Rust code for a BuiltinFilter value
///
/// Converts a validated catalog entry into Rust source code that recreates the
/// filter definition with its shader embedded as a string literal.
fn dump_builtin_filter(filter: &CatalogFilter) -> String {
    let spec = &filter.spec;
    let mut output = String::new();
    output.push_str("    BuiltinFilter {\n");
    output.push_str("        definition: FilterDefinition {\n");
    output.push_str(&format!("            id: {:?},\n", spec.id));
    output.push_str(&format!("            description: {:?},\n", spec.description.as_deref().unwrap_or("")));

    let inputs = spec.inputs.iter().map(|i| format!("{i:?}")).collect::<Vec<_>>().join(", ");
    output.push_str(&format!("            inputs: &[{inputs}],\n"));

    output.push_str("            parameters: &[\n");
    for parameter in &spec.parameters {
        let default = parameter.default.iter().map(|v| format!("{v:?}")).collect::<Vec<_>>().join(", ");
        let compile_time = match &parameter.compile_time {
            Some(name) => format!("Some({name:?})"),
            None => "None".to_string(),
        };
        output.push_str(&format!(
            "                ParameterSpec {{ key: {:?}, kind: ParameterKind::{}, default: &[{default}], compile_time: {compile_time} }},\n",
            parameter.key,
            parameter.kind.variant_name(),
        ));
    }
    output.push_str("            ],\n");

    output.push_str(&format!("            region: {},\n", dump_region_rule(&spec.region)));
    output.push_str("        },\n");
    output.push_str(&format!("        shader: {:?},\n", filter.shader));
    output.push_str("    },\n");
    output
}

/// Generates the filters.rs file with the built-in catalog table
fn write_code() {
    let project_dir = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .expect("Failed to get parent directory")
        .parent()
        .expect("Failed to get grandparent directory")
        .to_path_buf();
    let wgsl_dir = project_dir.join("wgsl");
    let manifest_path = wgsl_dir.join("filters.yaml");

    println!("cargo:rerun-if-changed={}", wgsl_dir.display());

    let catalog = load_catalog(manifest_path.to_str().expect("Failed to convert path to string"), true).expect("Failed to load filter catalog");

    let mut code = String::new();
    code.push_str("// This file is generated by the build script.\n\n");
    code.push_str("pub const BUILTIN_FILTERS: &[BuiltinFilter] = &[\n");
    for filter in &catalog.filters {
        code.push_str(&dump_builtin_filter(filter));
    }
    code.push_str("];\n\n");
    code.push_str("// END OF GENERATED CODE\n");

    let out_dir = std::env::var("OUT_DIR").expect("OUT_DIR not set");
    let output_path = std::path::PathBuf::from(out_dir).join("filters.rs");
    std::fs::write(output_path, code).expect("Failed to write filters.rs");
}

fn main() {
    write_code();
}
