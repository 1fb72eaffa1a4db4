//! Turning generated files into the tree mounted in the sandbox.

pub mod manifest;
pub mod policy;
pub mod preset;
pub mod tree;

use crate::models::FileMap;

pub use manifest::{is_dependency_allowed, merge_package_json};
pub use policy::filter_generated_files;
pub use tree::{FileSystemTree, TreeNode};

pub const MANIFEST_PATH: &str = "package.json";
pub const META_PATH: &str = "vibe.meta.json";

/// Preset tree overlaid with the generated files that pass the write policy.
/// A generated `package.json` only contributes allow-listed dependencies.
pub fn merge_with_preset(generated: &FileMap) -> FileMap {
    let mut merged = preset::preset_files();

    let generated_manifest = generated
        .iter()
        .find(|(path, _)| path.trim_start_matches('/') == MANIFEST_PATH)
        .map(|(_, contents)| contents);
    if let (Some(generated_manifest), Some(preset_manifest)) = (generated_manifest, merged.get(MANIFEST_PATH)) {
        let combined = merge_package_json(preset_manifest, generated_manifest);
        merged.insert(MANIFEST_PATH.to_string(), combined);
    }

    let allowed = filter_generated_files(generated);
    tracing::debug!(
        preset = merged.len(),
        generated = allowed.len(),
        "merging generated files with preset"
    );
    merged.extend(allowed);
    merged
}
