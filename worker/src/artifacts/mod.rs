//! Build artifacts: discovery, content types and upload

pub mod content_type;
pub mod scanner;
pub mod store;
pub mod uploader;

use std::path::{Component, Path, PathBuf};

/// Object key prefix under which every project's artifacts live
pub const OUTPUTS_PREFIX: &str = "__outputs";

/// One file to upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRecord {
    pub local_path: PathBuf,
    pub remote_key: String,
    pub content_type: String,
}

impl ArtifactRecord {
    /// Describe the file at `relative_path` below `output_root`
    pub fn new(output_root: &Path, relative_path: &Path, project_id: &str) -> Self {
        Self {
            local_path: output_root.join(relative_path),
            remote_key: remote_key(project_id, relative_path),
            content_type: content_type::ContentTypeResolver::resolve(relative_path),
        }
    }
}

/// `__outputs/{project_id}/{relative_path}` with forward slashes
pub fn remote_key(project_id: &str, relative_path: &Path) -> String {
    let mut key = format!("{}/{}", OUTPUTS_PREFIX, project_id);
    for component in relative_path.components() {
        if let Component::Normal(part) = component {
            key.push('/');
            key.push_str(&part.to_string_lossy());
        }
    }
    key
}
