// File: src/package.rs
//
// Package installation: copies a source file into the per-user package
// directory under a validated name. Installation never executes the
// installed code.

use crate::errors::EmberError;
use crate::module::{validate_module_name, MODULE_EXTENSION};
use std::fs;
use std::path::PathBuf;

/// Root of the per-user package store: `~/.ember/packages`
pub fn packages_root() -> Result<PathBuf, EmberError> {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| EmberError::io("Cannot locate home directory (HOME is unset)"))?;
    Ok(home.join(".ember").join("packages"))
}

/// Install `source_path` (a host path) as package `name`. Creates
/// `~/.ember/packages/<name>/package.ember` with directory mode 0755.
pub fn install_library(name: &str, source_path: &str) -> Result<PathBuf, EmberError> {
    validate_module_name(name)?;

    let source = PathBuf::from(source_path);
    let metadata = fs::metadata(&source).map_err(|e| {
        EmberError::io(format!("Source file '{}' is not readable: {}", source_path, e))
    })?;
    if !metadata.is_file() {
        return Err(EmberError::io(format!("Source path '{}' is not a file", source_path)));
    }

    let package_dir = packages_root()?.join(name);
    create_package_dir(&package_dir)?;

    let target = package_dir.join(format!("package.{}", MODULE_EXTENSION));
    fs::copy(&source, &target).map_err(|e| {
        EmberError::io(format!("Failed to install '{}' as '{}': {}", source_path, name, e))
    })?;

    Ok(target)
}

#[cfg(unix)]
fn create_package_dir(dir: &std::path::Path) -> Result<(), EmberError> {
    use std::os::unix::fs::DirBuilderExt;
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true).mode(0o755);
    builder
        .create(dir)
        .map_err(|e| EmberError::io(format!("Failed to create '{}': {}", dir.display(), e)))
}

#[cfg(not(unix))]
fn create_package_dir(dir: &std::path::Path) -> Result<(), EmberError> {
    fs::create_dir_all(dir)
        .map_err(|e| EmberError::io(format!("Failed to create '{}': {}", dir.display(), e)))
}
