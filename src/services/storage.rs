use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};

/// Key-addressed object storage shared by every stage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write an object, replacing any previous content under the same key.
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Keys under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Public read URL of a key. Pure function of the key.
    fn public_url(&self, key: &str) -> String;
}

/// Client for S3-compatible object storage.
pub struct S3BlobStore {
    bucket: Box<Bucket>,
    public_base_url: String,
}

impl S3BlobStore {
    pub fn new(
        bucket_name: &str,
        region: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
        public_base_url: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: region.to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self {
            bucket,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        })
    }
}

fn check_status(key: &str, status: u16) -> Result<(), StorageError> {
    match status {
        200..=299 => Ok(()),
        404 => Err(StorageError::NotFound(key.to_string())),
        code => Err(StorageError::Status {
            key: key.to_string(),
            code,
        }),
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(key, data, content_type)
            .await
            .map_err(StorageError::S3)?;
        check_status(key, response.status_code())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket.get_object(key).await.map_err(StorageError::S3)?;
        check_status(key, response.status_code())?;
        Ok(response.to_vec())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let pages = self
            .bucket
            .list(prefix.to_string(), None)
            .await
            .map_err(StorageError::S3)?;

        let mut keys: Vec<String> = pages
            .into_iter()
            .flat_map(|page| page.contents.into_iter().map(|object| object.key))
            // Console-created "folder" markers.
            .filter(|key| !key.ends_with('/'))
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Storage returned HTTP {code} for {key}")]
    Status { key: String, code: u16 },

    #[error("Storage configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_status() {
        assert!(check_status("k", 200).is_ok());
        assert!(matches!(check_status("k", 404), Err(StorageError::NotFound(_))));
        assert!(matches!(
            check_status("k", 503),
            Err(StorageError::Status { code: 503, .. })
        ));
    }

    #[test]
    fn test_public_url_is_derived_from_key() {
        let store = S3BlobStore::new(
            "s3musicproject",
            "ap-northeast-2",
            "https://s3.ap-northeast-2.amazonaws.com",
            "key",
            "secret",
            "https://s3musicproject.s3.ap-northeast-2.amazonaws.com/",
        )
        .unwrap();
        assert_eq!(
            store.public_url("u1/separation/song_vocals.wav"),
            "https://s3musicproject.s3.ap-northeast-2.amazonaws.com/u1/separation/song_vocals.wav"
        );
    }
}
