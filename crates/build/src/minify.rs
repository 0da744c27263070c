//! WGSL shader validation and minification utilities.
//!
//! This module checks that filter shaders are well formed before they are embedded
//! and reduces the size of their source code.

use std::fmt;

/// Workgroup size every filter shader must declare, in both dimensions
pub const FILTER_WORKGROUP_SIZE: u32 = 8;

/// Entry point every filter shader must export
pub const FILTER_ENTRY_POINT: &str = "main";

/// Errors reported while validating a filter shader
#[derive(Debug, Clone)]
pub enum ShaderValidationError {
    /// The WGSL failed to parse (rendered diagnostic)
    Parse(String),
    /// The module failed naga validation (rendered diagnostic)
    Invalid(String),
    /// No compute entry point named `main`
    MissingEntryPoint,
    /// The entry point uses a different workgroup size
    WorkgroupSize([u32; 3]),
    /// An override constant required by a compile-time parameter is not declared
    MissingOverride(String),
}

impl fmt::Display for ShaderValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(message) => write!(f, "WGSL parse error: {message}"),
            Self::Invalid(message) => write!(f, "WGSL validation error: {message}"),
            Self::MissingEntryPoint => write!(f, "Shader has no compute entry point named '{FILTER_ENTRY_POINT}'"),
            Self::WorkgroupSize(size) => {
                write!(f, "Shader workgroup size is {size:?}, expected [{FILTER_WORKGROUP_SIZE}, {FILTER_WORKGROUP_SIZE}, 1]")
            }
            Self::MissingOverride(name) => write!(f, "Shader does not declare override constant '{name}'"),
        }
    }
}

impl std::error::Error for ShaderValidationError {}

/// Validates a filter shader.
///
/// Parses the WGSL with `naga`, runs the full validator, and checks the conventions
/// the engine relies on: a `main` compute entry point with an 8x8 workgroup and an
/// `override` declaration for every compile-time parameter.
///
/// # Arguments
///
/// * `shader` - WGSL source code.
/// * `overrides` - Names of the override constants the shader must declare.
pub fn validate_wgsl(shader: &str, overrides: &[&str]) -> Result<(), ShaderValidationError> {
    let module = naga::front::wgsl::parse_str(shader).map_err(|e| ShaderValidationError::Parse(e.emit_to_string(shader)))?;

    let mut validator = naga::valid::Validator::new(naga::valid::ValidationFlags::all(), naga::valid::Capabilities::all());
    validator.validate(&module).map_err(|e| ShaderValidationError::Invalid(e.emit_to_string(shader)))?;

    let entry_point = module
        .entry_points
        .iter()
        .find(|ep| ep.name == FILTER_ENTRY_POINT && ep.stage == naga::ShaderStage::Compute)
        .ok_or(ShaderValidationError::MissingEntryPoint)?;
    if entry_point.workgroup_size != [FILTER_WORKGROUP_SIZE, FILTER_WORKGROUP_SIZE, 1] {
        return Err(ShaderValidationError::WorkgroupSize(entry_point.workgroup_size));
    }

    for name in overrides {
        let declared = module.overrides.iter().any(|(_, o)| o.name.as_deref() == Some(*name));
        if !declared {
            return Err(ShaderValidationError::MissingOverride(name.to_string()));
        }
    }

    Ok(())
}

/// Minifies WGSL shader source code to reduce binary size.
///
/// Shaders without override constants are parsed with `naga`, renamed with
/// `wgsl-minifier`, and written back before the source pass. naga's WGSL writer
/// cannot emit `override` declarations, so shaders that declare them only have
/// their comments stripped ahead of the source pass. Override constants and the
/// entry point keep their names in both cases.
///
/// # Arguments
///
/// * `shader` - A string slice containing the WGSL shader source code.
///
/// # Returns
///
/// A `Result` containing the minified WGSL source code as a `String`, or an error if parsing fails.
pub fn minify_wgsl(shader: &str) -> Result<String, Box<dyn std::error::Error>> {
    let mut module = naga::front::wgsl::parse_str(shader)?;
    if !module.overrides.is_empty() {
        return Ok(wgsl_minifier::minify_wgsl_source(&strip_comments(shader)));
    }

    wgsl_minifier::minify_module(&mut module);

    let mut validator = naga::valid::Validator::new(naga::valid::ValidationFlags::all(), naga::valid::Capabilities::all());
    let info = validator.validate(&module)?;
    let output = naga::back::wgsl::write_string(&module, &info, naga::back::wgsl::WriterFlags::empty())?;

    Ok(wgsl_minifier::minify_wgsl_source(&output))
}

/// Removes `//` line comments and nested `/* */` block comments
///
/// A comment is replaced by a single space so the tokens around it stay separate.
fn strip_comments(shader: &str) -> String {
    let mut output = String::with_capacity(shader.len());
    let mut chars = shader.chars().peekable();
    let mut depth = 0usize;

    while let Some(c) = chars.next() {
        let next = chars.peek().copied();
        if depth > 0 {
            match (c, next) {
                ('*', Some('/')) => {
                    chars.next();
                    depth -= 1;
                    if depth == 0 {
                        output.push(' ');
                    }
                }
                ('/', Some('*')) => {
                    chars.next();
                    depth += 1;
                }
                _ => {}
            }
            continue;
        }
        match (c, next) {
            ('/', Some('/')) => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
                output.push('\n');
            }
            ('/', Some('*')) => {
                chars.next();
                depth = 1;
            }
            _ => output.push(c),
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLUR_LIKE: &str = r#"
override RADIUS: i32 = 1;

@group(0) @binding(2) var output: texture_storage_2d<rgba32float, write>;

@compute @workgroup_size(8, 8, 1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    // write something depending on the override
    textureStore(output, vec2<i32>(id.xy), vec4<f32>(f32(RADIUS)));
}
"#;

    #[test]
    fn test_accepts_conforming_shader() {
        assert!(validate_wgsl(BLUR_LIKE, &["RADIUS"]).is_ok());
    }

    #[test]
    fn test_reports_missing_override() {
        assert!(matches!(validate_wgsl(BLUR_LIKE, &["SIGMA"]), Err(ShaderValidationError::MissingOverride(name)) if name == "SIGMA"));
    }

    #[test]
    fn test_reports_wrong_workgroup_size() {
        let shader = BLUR_LIKE.replace("@workgroup_size(8, 8, 1)", "@workgroup_size(16, 16, 1)");
        assert!(matches!(validate_wgsl(&shader, &[]), Err(ShaderValidationError::WorkgroupSize([16, 16, 1]))));
    }

    #[test]
    fn test_reports_parse_errors() {
        assert!(matches!(validate_wgsl("fn main( {", &[]), Err(ShaderValidationError::Parse(_))));
    }

    const INVERT_LIKE: &str = r#"
@group(0) @binding(2) var output: texture_storage_2d<rgba32float, write>;
// Reads input 0 at the invocation's texel.
@group(0) @binding(3) var input0: texture_2d<f32>;

fn load_input0(coord: vec2<i32>) -> vec4<f32> {
    /* out-of-range coordinates /* nested */ return zero */
    return textureLoad(input0, coord, 0);
}

@compute @workgroup_size(8, 8, 1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let c = load_input0(vec2<i32>(id.xy)); // premultiplied
    textureStore(output, vec2<i32>(id.xy), vec4<f32>(c.a - c.rgb, c.a));
}
"#;

    #[test]
    fn test_minify_shrinks_source() {
        let minified = minify_wgsl(BLUR_LIKE).unwrap();
        assert!(minified.contains("RADIUS"));
        assert!(!minified.contains("//"));
        assert!(minified.len() < BLUR_LIKE.len());
        validate_wgsl(&minified, &["RADIUS"]).unwrap();
    }

    #[test]
    fn test_minified_shader_with_comments_stays_valid() {
        let minified = minify_wgsl(INVERT_LIKE).unwrap();
        assert!(!minified.contains("//"));
        assert!(!minified.contains("/*"));
        assert!(minified.len() < INVERT_LIKE.len());
        validate_wgsl(&minified, &[]).unwrap();
    }

    #[test]
    fn test_strip_comments() {
        assert_eq!(strip_comments("a // b\nc"), "a \nc");
        assert_eq!(strip_comments("a/* b /* c */ d */e"), "a e");
        assert_eq!(strip_comments("a / b"), "a / b");
    }
}
