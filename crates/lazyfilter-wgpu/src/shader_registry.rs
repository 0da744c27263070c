//! Mapping from filter identifiers to WGSL compute programs

use crate::filters::builtin_filters;
use std::borrow::Cow;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::RwLock;

/// Source of one filter's compute shader
///
/// Every shader exposes a `main` entry point with an 8x8 workgroup and follows the
/// binding layout documented in `wgsl/filters.yaml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSource {
    pub wgsl: Cow<'static, str>,
}

impl ShaderSource {
    pub fn new(wgsl: impl Into<Cow<'static, str>>) -> Self {
        Self { wgsl: wgsl.into() }
    }

    /// Hash of the source text, used to tell a replaced shader from the one a pipeline was built from
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.wgsl.hash(&mut hasher);
        hasher.finish()
    }
}

/// Filter identifier to shader source table
#[derive(Debug, Default)]
pub struct ShaderRegistry {
    shaders: RwLock<HashMap<String, ShaderSource>>,
}

impl ShaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the shaders of every built-in filter
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for filter in builtin_filters() {
            registry.register(filter.definition.id, ShaderSource::new(filter.shader));
        }
        registry
    }

    /// Adds or replaces a shader, returning the replaced one
    ///
    /// Pipelines compiled from a replaced source are rebuilt on their next request.
    pub fn register(&self, filter: impl Into<String>, source: ShaderSource) -> Option<ShaderSource> {
        self.shaders.write().unwrap_or_else(|e| e.into_inner()).insert(filter.into(), source)
    }

    pub fn remove(&self, filter: &str) -> Option<ShaderSource> {
        self.shaders.write().unwrap_or_else(|e| e.into_inner()).remove(filter)
    }

    /// Shader for a filter, if one is registered
    pub fn source(&self, filter: &str) -> Option<ShaderSource> {
        self.shaders.read().unwrap_or_else(|e| e.into_inner()).get(filter).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_sources() {
        let registry = ShaderRegistry::with_builtins();
        let brightness = registry.source("brightness").unwrap();
        assert!(brightness.wgsl.contains("main"));
        assert!(registry.source("box_blur").unwrap().wgsl.contains("RADIUS"));
        assert_eq!(registry.source("does_not_exist"), None);
    }

    #[test]
    fn test_register_and_remove() {
        let registry = ShaderRegistry::new();
        assert!(registry.source("custom").is_none());
        registry.register("custom", ShaderSource::new("fn main() {}"));
        assert_eq!(registry.source("custom").unwrap().wgsl, "fn main() {}");
        assert!(registry.remove("custom").is_some());
        assert!(registry.source("custom").is_none());
    }

    #[test]
    fn test_fingerprint_follows_source_text() {
        let a = ShaderSource::new("fn main() {}");
        assert_eq!(a.fingerprint(), ShaderSource::new(String::from("fn main() {}")).fingerprint());
        assert_ne!(a.fingerprint(), ShaderSource::new("fn main() { }").fingerprint());
    }
}
