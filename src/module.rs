// File: src/module.rs
//
// Module loading state for the Ember VM: name validation, the loaded
// cache, the in-progress stack used for cycle handling, and the ordered
// module search paths. Execution of module code lives in the VM itself
// (src/vm.rs), which resolves sources through the VFS.

use crate::errors::EmberError;
use crate::value::Value;
use ahash::AHashMap;

pub const MODULE_EXTENSION: &str = "ember";
const MAX_MODULE_NAME: usize = 64;

/// A loaded module: name plus the snapshot of its globals at the end of
/// top-level execution.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub exports: Vec<(String, Value)>,
}

/// Manages module caching, cycle detection, and search paths.
#[derive(Debug, Default)]
pub struct ModuleLoader {
    loaded: AHashMap<String, Module>,
    /// Modules currently executing their top level
    loading: Vec<String>,
    /// Virtual directories searched in order for `<name>.ember`
    search_paths: Vec<String>,
}

impl ModuleLoader {
    pub fn new() -> Self {
        ModuleLoader {
            loaded: AHashMap::new(),
            loading: Vec::new(),
            search_paths: vec!["/app".to_string(), "/app/modules".to_string()],
        }
    }

    pub fn cached(&self, name: &str) -> Option<&Module> {
        self.loaded.get(name)
    }

    pub fn cache(&mut self, module: Module) {
        self.loaded.insert(module.name.clone(), module);
    }

    pub fn is_loading(&self, name: &str) -> bool {
        self.loading.iter().any(|n| n == name)
    }

    pub fn begin_loading(&mut self, name: &str) {
        self.loading.push(name.to_string());
    }

    pub fn finish_loading(&mut self, name: &str) {
        if let Some(pos) = self.loading.iter().rposition(|n| n == name) {
            self.loading.remove(pos);
        }
    }

    pub fn search_paths(&self) -> &[String] {
        &self.search_paths
    }

    /// Add a module search path (a virtual directory). Rejects
    /// traversal-bearing and duplicate paths; existence is checked by
    /// the caller against the VFS.
    pub fn add_search_path(&mut self, path: &str) -> Result<(), EmberError> {
        if path.contains("..") {
            return Err(EmberError::security(format!(
                "Module path '{}' contains traversal",
                path
            )));
        }
        if self.search_paths.iter().any(|p| p == path) {
            return Err(EmberError::import(format!("Duplicate module path '{}'", path)));
        }
        self.search_paths.push(path.to_string());
        Ok(())
    }

    /// All values the garbage collector must treat as roots
    pub fn root_values(&self) -> impl Iterator<Item = &Value> {
        self.loaded.values().flat_map(|m| m.exports.iter().map(|(_, v)| v))
    }
}

/// Validate a module or package name: printable ASCII, bounded length,
/// no path separators or shell metacharacters, no leading dash.
pub fn validate_module_name(name: &str) -> Result<(), EmberError> {
    if name.is_empty() || name.len() > MAX_MODULE_NAME {
        return Err(EmberError::security(format!(
            "Invalid module name '{}': must be 1-{} characters",
            name, MAX_MODULE_NAME
        )));
    }
    if name.starts_with('-') {
        return Err(EmberError::security(format!(
            "Invalid module name '{}': leading dash",
            name
        )));
    }
    if name.contains("..") {
        return Err(EmberError::security(format!(
            "Invalid module name '{}': path traversal",
            name
        )));
    }
    for c in name.chars() {
        if !c.is_ascii() || c.is_ascii_control() || matches!(c, '/' | '\\' | '|' | ';') {
            return Err(EmberError::security(format!(
                "Invalid module name '{}': illegal character",
                name
            )));
        }
    }
    Ok(())
}
