//! # Storage Backends
//!
//! Climatology artifacts and report tables may be published to the local
//! filesystem or to Amazon S3. The backend is picked from the path:
//!
//! - **S3 paths**: `s3://bucket-name/path/to/artifact.nc`
//! - **Local paths**: anything else
//!
//! Local writes go to a temporary file in the destination directory that is
//! renamed into place, so a reader never observes a partially written file.
//! S3 objects are uploaded in a single request.
//!
//! ```rust,no_run
//! use offshore_climatology::storage::{StorageBackend, StorageFactory};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = StorageFactory::from_path("s3://my-bucket/windows.nc").await?;
//!     let data = storage.read("s3://my-bucket/windows.nc").await?;
//!     storage.write("s3://my-bucket/windows_copy.nc", &data).await?;
//!     Ok(())
//! }
//! ```

use aws_config::BehaviorVersion;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::operation::put_object::PutObjectError;
use std::path::Path;
use thiserror::Error;
use tokio::fs;

/// Errors raised by a storage backend.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 GetObject error: {0}")]
    S3GetObject(#[from] SdkError<GetObjectError>),

    #[error("S3 PutObject error: {0}")]
    S3PutObject(#[from] SdkError<PutObjectError>),

    #[error("S3 HeadObject error: {0}")]
    S3HeadObject(#[from] SdkError<HeadObjectError>),

    #[error("S3 body stream error: {0}")]
    ByteStream(String),

    #[error("invalid S3 path: {0}")]
    InvalidS3Path(String),

    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Whole-object read and write access to one kind of storage.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    /// Reads the entire object at `path`.
    async fn read(&self, path: &str) -> StorageResult<Vec<u8>>;

    /// Replaces the object at `path` with `data`. Either the previous
    /// object or the complete new one is visible, never a partial write.
    async fn write(&self, path: &str, data: &[u8]) -> StorageResult<()>;

    async fn exists(&self, path: &str) -> StorageResult<bool>;
}

fn classify_io(path: &str, e: std::io::Error) -> StorageError {
    match e.kind() {
        std::io::ErrorKind::NotFound => StorageError::PathNotFound(path.to_string()),
        std::io::ErrorKind::PermissionDenied => StorageError::PermissionDenied(path.to_string()),
        _ => StorageError::Io(e),
    }
}

/// Local filesystem backend.
#[derive(Debug, Clone)]
pub struct LocalStorage;

#[async_trait::async_trait]
impl StorageBackend for LocalStorage {
    async fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        fs::read(path).await.map_err(|e| classify_io(path, e))
    }

    async fn write(&self, path: &str, data: &[u8]) -> StorageResult<()> {
        let target = Path::new(path);
        let dir = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)
            .await
            .map_err(|e| classify_io(path, e))?;

        // staged next to the target so the rename stays on one filesystem
        let staged = tempfile::Builder::new()
            .prefix(".")
            .suffix(".part")
            .tempfile_in(dir)
            .map_err(|e| classify_io(path, e))?;
        fs::write(staged.path(), data)
            .await
            .map_err(|e| classify_io(path, e))?;
        staged
            .persist(target)
            .map_err(|e| classify_io(path, e.error))?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        match fs::metadata(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

/// Amazon S3 backend. Credentials come from the default AWS provider chain
/// (environment, shared config, instance roles).
#[derive(Debug, Clone)]
pub struct S3Storage {
    client: S3Client,
}

impl S3Storage {
    pub async fn new() -> StorageResult<Self> {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Ok(Self::from_config(&config))
    }

    pub fn from_config(config: &aws_config::SdkConfig) -> Self {
        S3Storage {
            client: S3Client::new(config),
        }
    }

    /// Splits `s3://bucket/key` into bucket and key.
    fn parse_s3_path(s3_path: &str) -> StorageResult<(String, String)> {
        let rest = s3_path.strip_prefix("s3://").ok_or_else(|| {
            StorageError::InvalidS3Path(format!("expected an s3:// prefix: {}", s3_path))
        })?;
        match rest.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
                Ok((bucket.to_string(), key.to_string()))
            }
            _ => Err(StorageError::InvalidS3Path(format!(
                "expected s3://bucket/key: {}",
                s3_path
            ))),
        }
    }
}

#[async_trait::async_trait]
impl StorageBackend for S3Storage {
    async fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        let (bucket, key) = Self::parse_s3_path(path)?;
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| match &e {
                SdkError::ServiceError(service_err) if service_err.err().is_no_such_key() => {
                    StorageError::PathNotFound(path.to_string())
                }
                _ => StorageError::S3GetObject(e),
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::ByteStream(e.to_string()))?
            .into_bytes()
            .to_vec();
        Ok(data)
    }

    async fn write(&self, path: &str, data: &[u8]) -> StorageResult<()> {
        let (bucket, key) = Self::parse_s3_path(path)?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(aws_sdk_s3::primitives::ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(StorageError::S3PutObject)?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        let (bucket, key) = Self::parse_s3_path(path)?;
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(service_err)) if service_err.err().is_not_found() => {
                Ok(false)
            }
            Err(e) => Err(StorageError::S3HeadObject(e)),
        }
    }
}

/// The backend selected for one path.
#[derive(Debug)]
pub enum Storage {
    Local(LocalStorage),
    S3(S3Storage),
}

#[async_trait::async_trait]
impl StorageBackend for Storage {
    async fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        match self {
            Storage::Local(storage) => storage.read(path).await,
            Storage::S3(storage) => storage.read(path).await,
        }
    }

    async fn write(&self, path: &str, data: &[u8]) -> StorageResult<()> {
        match self {
            Storage::Local(storage) => storage.write(path, data).await,
            Storage::S3(storage) => storage.write(path, data).await,
        }
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        match self {
            Storage::Local(storage) => storage.exists(path).await,
            Storage::S3(storage) => storage.exists(path).await,
        }
    }
}

/// Picks a backend from a path: `s3://` goes to S3, everything else is local.
pub struct StorageFactory;

impl StorageFactory {
    pub async fn from_path(path: &str) -> StorageResult<Storage> {
        if Self::is_s3_path(path) {
            Ok(Storage::S3(S3Storage::new().await?))
        } else {
            Ok(Storage::Local(LocalStorage))
        }
    }

    pub fn is_s3_path(path: &str) -> bool {
        path.starts_with("s3://")
    }

    pub fn is_local_path(path: &str) -> bool {
        !Self::is_s3_path(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_write_read_exists() -> Result<(), Box<dyn std::error::Error>> {
        let storage = LocalStorage;
        let dir = TempDir::new()?;
        let path = dir.path().join("nested/windows.nc");
        let path = path.to_str().unwrap();

        storage.write(path, b"first").await?;
        assert_eq!(storage.read(path).await?, b"first");
        assert!(storage.exists(path).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_local_write_replaces_and_leaves_no_staging_files()
    -> Result<(), Box<dyn std::error::Error>> {
        let storage = LocalStorage;
        let dir = TempDir::new()?;
        let path = dir.path().join("climatology.nc");
        let path_str = path.to_str().unwrap();

        storage.write(path_str, b"old artifact").await?;
        storage.write(path_str, b"new").await?;
        assert_eq!(storage.read(path_str).await?, b"new");

        let names: Vec<String> = std::fs::read_dir(dir.path())?
            .map(|e| e.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<Result<_, _>>()?;
        assert_eq!(names, vec!["climatology.nc".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_local_not_found() -> Result<(), Box<dyn std::error::Error>> {
        let storage = LocalStorage;
        let result = storage.read("/nonexistent/path/windows.nc").await;
        assert!(matches!(result, Err(StorageError::PathNotFound(_))));
        assert!(!storage.exists("/nonexistent/path/windows.nc").await?);
        Ok(())
    }

    #[test]
    fn test_s3_path_parsing() {
        let (bucket, key) = S3Storage::parse_s3_path("s3://climate/out/windows.nc").unwrap();
        assert_eq!(bucket, "climate");
        assert_eq!(key, "out/windows.nc");

        assert!(S3Storage::parse_s3_path("http://climate/windows.nc").is_err());
        assert!(S3Storage::parse_s3_path("s3://").is_err());
        assert!(S3Storage::parse_s3_path("s3://climate").is_err());
        assert!(S3Storage::parse_s3_path("s3:///windows.nc").is_err());
    }

    #[tokio::test]
    async fn test_factory_path_detection() -> Result<(), Box<dyn std::error::Error>> {
        assert!(StorageFactory::is_s3_path("s3://climate/windows.nc"));
        assert!(StorageFactory::is_local_path("data/windows.nc"));
        let storage = StorageFactory::from_path("/data/windows.nc").await?;
        assert!(matches!(storage, Storage::Local(_)));
        Ok(())
    }

    #[tokio::test]
    #[ignore] // needs AWS credentials and TEST_S3_BUCKET
    async fn test_s3_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let Ok(bucket) = std::env::var("TEST_S3_BUCKET") else {
            return Ok(());
        };
        let storage = StorageFactory::from_path(&format!("s3://{}/x", bucket)).await?;
        let path = format!("s3://{}/offshore-climatology-test/artifact.nc", bucket);
        storage.write(&path, b"artifact").await?;
        assert!(storage.exists(&path).await?);
        assert_eq!(storage.read(&path).await?, b"artifact");
        Ok(())
    }
}
