mod object_source;
mod s3_source;

pub use object_source::{LocalObjectSource, ObjectSource};
pub use s3_source::{create_s3_client, load_aws_config, S3ObjectSource};
