//! Object store construction

use std::sync::Arc;

use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::ObjectStore;
use tracing::info;

use crate::app::settings::StorageSettings;
use crate::errors::WorkerError;

/// Build the artifact bucket client described by `settings`
///
/// S3 credentials come from the standard `AWS_*` environment variables.
pub fn create_object_store(settings: &StorageSettings) -> Result<Arc<dyn ObjectStore>, WorkerError> {
    match settings.storage_type.as_str() {
        "s3" => {
            let mut builder = AmazonS3Builder::from_env()
                .with_bucket_name(&settings.bucket)
                .with_region(&settings.region);
            if let Some(endpoint) = &settings.endpoint {
                builder = builder
                    .with_endpoint(endpoint)
                    .with_allow_http(endpoint.starts_with("http://"));
            }
            let store = builder
                .build()
                .map_err(|e| WorkerError::StorageError(format!("failed to create S3 store: {e}")))?;
            info!(bucket = %settings.bucket, region = %settings.region, "S3 artifact store ready");
            Ok(Arc::new(store))
        }
        "local" => {
            std::fs::create_dir_all(&settings.bucket)?;
            let store = LocalFileSystem::new_with_prefix(&settings.bucket).map_err(|e| {
                WorkerError::StorageError(format!("failed to create local store: {e}"))
            })?;
            info!(path = %settings.bucket, "Local artifact store ready");
            Ok(Arc::new(store))
        }
        "memory" => {
            info!("In-memory artifact store ready, uploads are discarded on exit");
            Ok(Arc::new(InMemory::new()))
        }
        other => Err(WorkerError::ConfigError(format!(
            "unsupported storage type: {}",
            other
        ))),
    }
}

/// Whether the store keeps object attributes such as the content type
pub fn supports_attributes(settings: &StorageSettings) -> bool {
    settings.storage_type != "local"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_storage_type() {
        let settings = StorageSettings {
            storage_type: "ftp".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            create_object_store(&settings),
            Err(WorkerError::ConfigError(_))
        ));
    }

    #[test]
    fn test_local_store_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let bucket = tmp.path().join("bucket");
        let settings = StorageSettings {
            storage_type: "local".to_string(),
            bucket: bucket.display().to_string(),
            ..Default::default()
        };
        assert!(create_object_store(&settings).is_ok());
        assert!(bucket.is_dir());
        assert!(!supports_attributes(&settings));
    }
}
