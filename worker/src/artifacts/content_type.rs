//! File name to MIME type mapping

use std::path::Path;

/// Used when the extension is missing or unknown
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Resolves the `Content-Type` an artifact is stored with
pub struct ContentTypeResolver;

impl ContentTypeResolver {
    /// Total: every input maps to some type
    pub fn resolve(path: impl AsRef<Path>) -> String {
        mime_guess::from_path(path)
            .first_raw()
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string()
    }
}
