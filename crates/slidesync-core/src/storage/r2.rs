//! Cloudflare R2 blob store.

use std::env;
use std::fmt;

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::{primitives::ByteStream, Client};
use aws_types::region::Region;

use super::{normalize_content_type, normalize_object_key, BlobStore};
use crate::{Error, Result};

const ENV_ACCOUNT_ID: &str = "R2_ACCOUNT_ID";
const ENV_BUCKET: &str = "R2_BUCKET";
const ENV_ACCESS_KEY_ID: &str = "R2_ACCESS_KEY_ID";
const ENV_SECRET_ACCESS_KEY: &str = "R2_SECRET_ACCESS_KEY";
const ENV_ENDPOINT_URL: &str = "R2_ENDPOINT_URL";

/// Cloudflare R2 configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct R2Config {
    /// Cloudflare account identifier.
    pub account_id: String,
    /// R2 bucket name.
    pub bucket: String,
    /// Access key id for S3-compatible auth.
    pub access_key_id: String,
    /// Secret access key for S3-compatible auth.
    pub secret_access_key: String,
    /// Optional S3-compatible endpoint overriding the account endpoint.
    pub endpoint_override: Option<String>,
}

impl fmt::Debug for R2Config {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("R2Config")
            .field("account_id", &self.account_id)
            .field("bucket", &self.bucket)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .field("endpoint_override", &self.endpoint_override)
            .finish()
    }
}

impl R2Config {
    /// Load R2 configuration from environment variables.
    ///
    /// Returns `Ok(None)` when no R2 variables are set.
    /// Returns an error when only a partial configuration is provided.
    pub fn from_env() -> Result<Option<Self>> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`R2Config::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<Self>> {
        parse_config(lookup)
    }

    /// S3-compatible endpoint URL.
    #[must_use]
    pub fn endpoint_url(&self) -> String {
        self.endpoint_override.clone().unwrap_or_else(|| {
            format!("https://{}.r2.cloudflarestorage.com", self.account_id)
        })
    }
}

/// R2-backed blob store.
#[derive(Clone, Debug)]
pub struct R2BlobStore {
    config: R2Config,
    client: Client,
}

impl R2BlobStore {
    #[must_use]
    pub fn new(config: R2Config) -> Self {
        let client = build_s3_client(&config);
        Self { config, client }
    }

    #[must_use]
    pub const fn config(&self) -> &R2Config {
        &self.config
    }
}

#[async_trait]
impl BlobStore for R2BlobStore {
    fn backend(&self) -> &'static str {
        "r2"
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.config.bucket)
            .send()
            .await
            .map_err(|error| storage_error("head_bucket", &self.config.bucket, None, error))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let object_key = normalize_object_key(key)?;

        let response = match self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(&object_key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(error)
                if error
                    .as_service_error()
                    .is_some_and(aws_sdk_s3::operation::get_object::GetObjectError::is_no_such_key) =>
            {
                return Ok(None);
            }
            Err(error) => {
                return Err(storage_error(
                    "get_object",
                    &self.config.bucket,
                    Some(&object_key),
                    error,
                ));
            }
        };

        let payload = response.body.collect().await.map_err(|error| {
            storage_error(
                "get_object_body",
                &self.config.bucket,
                Some(&object_key),
                error,
            )
        })?;

        Ok(Some(payload.into_bytes().to_vec()))
    }

    async fn put(&self, key: &str, bytes: &[u8], content_type: Option<&str>) -> Result<()> {
        let object_key = normalize_object_key(key)?;

        let mut request = self
            .client
            .put_object()
            .bucket(&self.config.bucket)
            .key(&object_key)
            .body(ByteStream::from(bytes.to_vec()));

        if let Some(content_type) = normalize_content_type(content_type) {
            request = request.content_type(content_type);
        }

        request.send().await.map_err(|error| {
            storage_error("put_object", &self.config.bucket, Some(&object_key), error)
        })?;

        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.trim().trim_start_matches('/');
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.config.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|error| {
                    storage_error("list_objects_v2", &self.config.bucket, Some(prefix), error)
                })?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .map(ToOwned::to_owned),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let object_key = normalize_object_key(key)?;

        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|error| {
                storage_error(
                    "delete_object",
                    &self.config.bucket,
                    Some(&object_key),
                    error,
                )
            })?;

        Ok(())
    }
}

fn parse_config(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<R2Config>> {
    let read = |key: &str| lookup(key).map(|value| value.trim().to_string());
    let account_id = read(ENV_ACCOUNT_ID);
    let bucket = read(ENV_BUCKET);
    let access_key_id = read(ENV_ACCESS_KEY_ID);
    let secret_access_key = read(ENV_SECRET_ACCESS_KEY);
    let endpoint_override = read(ENV_ENDPOINT_URL);

    let any_present = account_id.is_some()
        || bucket.is_some()
        || access_key_id.is_some()
        || secret_access_key.is_some()
        || endpoint_override.is_some();

    if !any_present {
        return Ok(None);
    }

    let mut missing = Vec::new();
    let mut require = |name: &'static str, value: Option<String>| match value {
        Some(value) if !value.is_empty() => value,
        _ => {
            missing.push(name);
            String::new()
        }
    };
    let config = R2Config {
        account_id: require(ENV_ACCOUNT_ID, account_id),
        bucket: require(ENV_BUCKET, bucket),
        access_key_id: require(ENV_ACCESS_KEY_ID, access_key_id),
        secret_access_key: require(ENV_SECRET_ACCESS_KEY, secret_access_key),
        endpoint_override: normalize_endpoint_url(endpoint_override)?,
    };

    if !missing.is_empty() {
        return Err(Error::InvalidInput(format!(
            "R2 configuration is incomplete. Missing: {}",
            missing.join(", ")
        )));
    }

    Ok(Some(config))
}

fn build_s3_client(config: &R2Config) -> Client {
    let credentials = Credentials::new(
        config.access_key_id.clone(),
        config.secret_access_key.clone(),
        None,
        None,
        "slidesync-r2-storage",
    );

    let sdk_config = aws_sdk_s3::config::Builder::new()
        .region(Region::new("auto"))
        .credentials_provider(credentials)
        .endpoint_url(config.endpoint_url())
        .force_path_style(true)
        .build();

    Client::from_conf(sdk_config)
}

fn storage_error(
    operation: &str,
    bucket: &str,
    object_key: Option<&str>,
    error: impl std::fmt::Display,
) -> Error {
    let target = object_key.map_or_else(|| bucket.to_string(), |key| format!("{bucket}/{key}"));
    Error::Storage(format!("R2 {operation} failed for {target}: {error}"))
}

fn normalize_endpoint_url(endpoint: Option<String>) -> Result<Option<String>> {
    let Some(value) = endpoint else {
        return Ok(None);
    };

    if value.is_empty() {
        return Ok(None);
    }
    if !crate::util::is_http_url(&value) {
        return Err(Error::InvalidInput(
            "R2_ENDPOINT_URL must start with http:// or https://".to_string(),
        ));
    }

    Ok(Some(value.trim_end_matches('/').to_string()))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;

    fn parse_from_map(map: &HashMap<&str, &str>) -> Result<Option<R2Config>> {
        parse_config(|key| map.get(key).map(|value| (*value).to_string()))
    }

    fn complete_map() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            (ENV_ACCOUNT_ID, "account-1"),
            (ENV_BUCKET, "bucket-a"),
            (ENV_ACCESS_KEY_ID, "AKID123"),
            (ENV_SECRET_ACCESS_KEY, "SECRET123"),
        ])
    }

    #[test]
    fn parse_config_none_returns_none() {
        let map = HashMap::new();
        assert!(parse_from_map(&map).unwrap().is_none());
    }

    #[test]
    fn parse_config_requires_all_required_values() {
        let mut map = HashMap::new();
        map.insert(ENV_ACCOUNT_ID, "account");
        map.insert(ENV_BUCKET, "bucket");

        let err = parse_from_map(&map).unwrap_err();
        match err {
            Error::InvalidInput(message) => {
                assert!(message.contains(ENV_ACCESS_KEY_ID));
                assert!(message.contains(ENV_SECRET_ACCESS_KEY));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn parse_config_defaults_to_account_endpoint() {
        let config = parse_from_map(&complete_map()).unwrap().unwrap();
        assert_eq!(
            config.endpoint_url(),
            "https://account-1.r2.cloudflarestorage.com"
        );
    }

    #[test]
    fn parse_config_accepts_endpoint_override() {
        let mut map = complete_map();
        map.insert(ENV_ENDPOINT_URL, "http://127.0.0.1:9000/");

        let config = parse_from_map(&map).unwrap().unwrap();
        assert_eq!(config.endpoint_url(), "http://127.0.0.1:9000");
    }

    #[test]
    fn parse_config_rejects_invalid_endpoint() {
        let mut map = complete_map();
        map.insert(ENV_ENDPOINT_URL, "minio.local:9000");

        let err = parse_from_map(&map).unwrap_err();
        match err {
            Error::InvalidInput(message) => assert!(message.contains(ENV_ENDPOINT_URL)),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn debug_redacts_secret() {
        let config = parse_from_map(&complete_map()).unwrap().unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("SECRET123"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    #[ignore = "Requires local R2 env vars in process environment or .env"]
    fn from_env_loads_real_r2_config() {
        let _ = dotenvy::dotenv();

        let config = R2Config::from_env()
            .expect("R2 env parsing should not error")
            .expect("R2 config should be present");

        assert!(!config.account_id.trim().is_empty());
        assert!(!config.bucket.trim().is_empty());
        assert!(!config.access_key_id.trim().is_empty());
        assert!(!config.secret_access_key.trim().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore = "Requires local R2 env vars plus network access"]
    async fn r2_bucket_exists_and_is_reachable() {
        let _ = dotenvy::dotenv();

        let config = R2Config::from_env()
            .expect("R2 env parsing should not error")
            .expect("R2 config should be present");
        let storage = R2BlobStore::new(config.clone());

        storage.ping().await.unwrap_or_else(|error| {
            panic!(
                "R2 bucket health check failed for bucket '{}': {error}",
                config.bucket
            )
        });
    }

    async fn wait_for_object_state(storage: &R2BlobStore, object_key: &str, expected: bool) -> bool {
        for _attempt in 0..10 {
            let exists = storage
                .list(object_key)
                .await
                .unwrap_or_else(|error| panic!("object listing failed: {error}"))
                .iter()
                .any(|candidate| candidate == object_key);
            if exists == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        false
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore = "Requires local R2 env vars plus network access"]
    async fn r2_object_roundtrip_put_get_delete() {
        let _ = dotenvy::dotenv();

        let config = R2Config::from_env()
            .expect("R2 env parsing should not error")
            .expect("R2 config should be present");
        let storage = R2BlobStore::new(config.clone());

        let object_key = format!(
            "slidesync-integration/{}.json",
            uuid::Uuid::now_v7()
        );
        let bytes = br#"{"roundtrip":true}"#;

        storage
            .put(&object_key, bytes, Some("application/json"))
            .await
            .unwrap_or_else(|error| panic!("R2 upload failed: {error}"));

        assert!(
            wait_for_object_state(&storage, &object_key, true).await,
            "Uploaded object was not observed in bucket '{}': {}",
            config.bucket,
            object_key
        );
        assert_eq!(
            storage.get(&object_key).await.unwrap().as_deref(),
            Some(&bytes[..])
        );

        storage.delete(&object_key).await.unwrap_or_else(|error| {
            panic!(
                "R2 delete failed for bucket '{}' key '{}': {error}",
                config.bucket, object_key
            )
        });

        assert!(
            wait_for_object_state(&storage, &object_key, false).await,
            "Deleted object still appears in bucket '{}': {}",
            config.bucket,
            object_key
        );
        assert!(storage.get(&object_key).await.unwrap().is_none());
    }
}
