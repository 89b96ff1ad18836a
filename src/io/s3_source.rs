use std::path::Path;

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::Client;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::object_source::{write_via_partial, ObjectSource};
use crate::error::IoError;

/// Error codes that mean the object will never be readable as addressed.
const REJECTED_ERROR_CODES: &[&str] = &[
    "AccessDenied",
    "AllAccessDisabled",
    "AccountProblem",
    "InvalidAccessKeyId",
    "SignatureDoesNotMatch",
    "NoSuchBucket",
    "InvalidBucketName",
    "InvalidObjectState",
    "InvalidArgument",
];

/// Error codes worth another attempt.
const TRANSIENT_ERROR_CODES: &[&str] = &[
    "SlowDown",
    "InternalError",
    "ServiceUnavailable",
    "RequestTimeout",
    "RequestTimeTooSkewed",
    "ExpiredToken",
];

/// S3-backed implementation of ObjectSource.
///
/// Streams the object body to a sibling `.part` file and renames it into
/// place once the download completes. A failed stream removes the partial file.
#[derive(Clone)]
pub struct S3ObjectSource {
    client: Client,
}

impl S3ObjectSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectSource for S3ObjectSource {
    async fn fetch_to(&self, bucket: &str, key: &str, dest: &Path) -> Result<u64, IoError> {
        let uri = format!("s3://{}/{}", bucket, key);

        let resp = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let code = e.as_service_error().and_then(|se| se.code()).map(str::to_string);
                let status = e.raw_response().map(|r| r.status().as_u16());
                match e {
                    SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
                        IoError::Connection(format!("{}: {}", uri, e))
                    }
                    other => classify_s3_error(
                        &uri,
                        code.as_deref(),
                        status,
                        DisplayErrorContext(&other).to_string(),
                    ),
                }
            })?;

        let body = resp.body;
        let stream_uri = uri.clone();
        let written = write_via_partial(dest, |partial| async move {
            let mut body = body;
            let mut file = tokio::fs::File::create(&partial).await?;
            let mut written = 0u64;

            while let Some(chunk) = body
                .try_next()
                .await
                .map_err(|e| IoError::Connection(format!("{}: {}", stream_uri, e)))?
            {
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            Ok::<_, IoError>(written)
        })
        .await?;

        debug!(source = %uri, dest = %dest.display(), bytes = written, "Downloaded object");
        Ok(written)
    }
}

/// Map a failed GetObject answer onto an IoError.
///
/// Known codes win over the HTTP status; without a known code, 4xx answers
/// other than 408 and 429 are rejections and everything else is retried.
pub(crate) fn classify_s3_error(
    uri: &str,
    code: Option<&str>,
    status: Option<u16>,
    detail: String,
) -> IoError {
    // Some S3-compatible services answer a bare 404 without an error code
    if code == Some("NoSuchKey") || (code.is_none() && status == Some(404)) {
        return IoError::NotFound(uri.to_string());
    }

    let message = format!("{}: {}", uri, detail);
    match code {
        Some(code) if REJECTED_ERROR_CODES.contains(&code) => IoError::Rejected(message),
        Some(code) if TRANSIENT_ERROR_CODES.contains(&code) => IoError::S3(message),
        _ => match status {
            Some(404) => IoError::NotFound(uri.to_string()),
            Some(408) | Some(429) => IoError::S3(message),
            Some(s) if (400..500).contains(&s) => IoError::Rejected(message),
            _ => IoError::S3(message),
        },
    }
}

/// Load the shared AWS configuration for the given region.
pub async fn load_aws_config(region: &str) -> SdkConfig {
    let region = aws_config::Region::new(region.to_string());
    aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(region)
        .load()
        .await
}

/// Create an S3 client with an optional custom endpoint.
///
/// Use a custom endpoint for S3-compatible services like MinIO:
/// ```ignore
/// let sdk_config = load_aws_config("us-east-1").await;
/// let client = create_s3_client(&sdk_config, Some("http://localhost:9000"));
/// ```
pub fn create_s3_client(sdk_config: &SdkConfig, endpoint_url: Option<&str>) -> Client {
    let builder = aws_sdk_s3::config::Builder::from(sdk_config);

    // S3-compatible services generally need path-style addressing
    let s3_config = match endpoint_url {
        Some(endpoint) => builder.endpoint_url(endpoint).force_path_style(true).build(),
        None => builder.build(),
    };

    Client::from_conf(s3_config)
}
