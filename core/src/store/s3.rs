use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::{Client, Config};
use chrono::{DateTime, Utc};
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::aws::load_sdk_config;
use crate::config::AwsOptions;
use crate::errors::StoreError;
use crate::store::{object_name, SnapshotObject, SnapshotStore};

/// Files above this size are uploaded in parts.
const MULTIPART_THRESHOLD: u64 = 64 * 1024 * 1024;
const PART_SIZE: usize = 64 * 1024 * 1024;

pub struct S3SnapshotStore {
    client: Client,
}

impl S3SnapshotStore {
    pub async fn new(options: &AwsOptions) -> Self {
        let sdk_config = load_sdk_config(options).await;
        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if options.endpoint_url.is_some() {
            // S3-compatible endpoints such as localstack or minio
            builder = builder.force_path_style(true);
        }
        Self::from_conf(builder.build())
    }

    pub fn from_conf(config: Config) -> Self {
        Self {
            client: Client::from_conf(config),
        }
    }

    async fn upload_multipart(
        &self,
        bucket: &str,
        key: &str,
        file: &Path,
    ) -> Result<(), StoreError> {
        let upload_error = |reason: String| StoreError::Upload {
            bucket: bucket.to_string(),
            key: key.to_string(),
            reason,
        };

        let upload = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| upload_error(DisplayErrorContext(&e).to_string()))?;
        let upload_id = upload
            .upload_id()
            .ok_or_else(|| upload_error("no upload id returned".to_string()))?
            .to_string();

        let parts = match self.upload_parts(bucket, key, &upload_id, file).await {
            Ok(parts) => parts,
            Err(e) => {
                if let Err(abort_error) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        bucket,
                        key,
                        "failed to abort multipart upload: {}",
                        DisplayErrorContext(&abort_error)
                    );
                }
                return Err(e);
            }
        };

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| upload_error(DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }

    async fn upload_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        file: &Path,
    ) -> Result<Vec<CompletedPart>, StoreError> {
        let upload_error = |reason: String| StoreError::Upload {
            bucket: bucket.to_string(),
            key: key.to_string(),
            reason,
        };

        let mut source = tokio::fs::File::open(file)
            .await
            .map_err(|e| upload_error(e.to_string()))?;
        let mut parts = Vec::new();
        let mut part_number = 1;
        loop {
            let mut buffer = Vec::with_capacity(PART_SIZE);
            let read = (&mut source)
                .take(PART_SIZE as u64)
                .read_to_end(&mut buffer)
                .await
                .map_err(|e| upload_error(e.to_string()))?;
            if read == 0 {
                break;
            }

            let part = self
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(buffer))
                .send()
                .await
                .map_err(|e| upload_error(DisplayErrorContext(&e).to_string()))?;
            debug!(bucket, key, part_number, bytes = read, "uploaded part");
            parts.push(
                CompletedPart::builder()
                    .e_tag(part.e_tag().unwrap_or_default())
                    .part_number(part_number)
                    .build(),
            );
            part_number += 1;
        }
        Ok(parts)
    }
}

#[async_trait]
impl SnapshotStore for S3SnapshotStore {
    async fn list(&self, bucket: &str) -> Result<Vec<SnapshotObject>, StoreError> {
        let mut objects = Vec::new();
        let mut continuation_token = None;
        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| StoreError::List {
                    bucket: bucket.to_string(),
                    reason: DisplayErrorContext(&e).to_string(),
                })?;

            for object in response.contents() {
                let Some(key) = object.key() else { continue };
                let last_modified = object
                    .last_modified()
                    .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos()))
                    .unwrap_or_default();
                objects.push(SnapshotObject {
                    name: key.to_string(),
                    last_modified,
                    size: object.size().unwrap_or_default().max(0) as u64,
                });
            }

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }
        debug!(bucket, objects = objects.len(), "listed S3 bucket");
        Ok(objects)
    }

    async fn upload(&self, bucket: &str, file: &Path) -> Result<(), StoreError> {
        let key = object_name(bucket, file)?;
        let upload_error = |reason: String| StoreError::Upload {
            bucket: bucket.to_string(),
            key: key.clone(),
            reason,
        };

        let size = tokio::fs::metadata(file)
            .await
            .map_err(|e| upload_error(e.to_string()))?
            .len();
        if size > MULTIPART_THRESHOLD {
            self.upload_multipart(bucket, &key, file).await?;
        } else {
            let body = ByteStream::from_path(file)
                .await
                .map_err(|e| upload_error(e.to_string()))?;
            self.client
                .put_object()
                .bucket(bucket)
                .key(&key)
                .body(body)
                .send()
                .await
                .map_err(|e| upload_error(DisplayErrorContext(&e).to_string()))?;
        }
        info!(bucket, key = %key, bytes = size, "uploaded snapshot to S3");
        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        name: &str,
        destination: &Path,
    ) -> Result<(), StoreError> {
        let download_error = |reason: String| StoreError::Download {
            bucket: bucket.to_string(),
            key: name.to_string(),
            reason,
        };

        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(name)
            .send()
            .await
            .map_err(|e| download_error(DisplayErrorContext(&e).to_string()))?;

        let result = async {
            let mut body = response.body;
            let mut out = tokio::fs::File::create(destination)
                .await
                .map_err(|e| download_error(e.to_string()))?;
            while let Some(bytes) = body
                .try_next()
                .await
                .map_err(|e| download_error(e.to_string()))?
            {
                out.write_all(&bytes)
                    .await
                    .map_err(|e| download_error(e.to_string()))?;
            }
            out.flush().await.map_err(|e| download_error(e.to_string()))
        }
        .await;

        if result.is_err() {
            if let Err(e) = tokio::fs::remove_file(destination).await {
                debug!(path = %destination.display(), "no partial download to remove: {}", e);
            }
        }
        result
    }

    async fn delete(&self, bucket: &str, name: &str) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(name)
            .send()
            .await
            .map_err(|e| StoreError::Delete {
                bucket: bucket.to_string(),
                key: name.to_string(),
                reason: DisplayErrorContext(&e).to_string(),
            })?;
        Ok(())
    }
}
