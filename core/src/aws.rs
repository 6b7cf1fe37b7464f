use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_s3::config::Credentials;

use crate::config::AwsOptions;

/// Loads the shared SDK config for S3 and Kinesis clients. Static
/// credentials are used when both keys are configured, otherwise the
/// default provider chain applies.
pub async fn load_sdk_config(options: &AwsOptions) -> SdkConfig {
    let mut loader =
        aws_config::defaults(BehaviorVersion::latest()).region(Region::new(options.region.clone()));

    if let (Some(access_key), Some(secret_key)) =
        (&options.access_key_id, &options.secret_access_key)
    {
        loader = loader.credentials_provider(Credentials::new(
            access_key,
            secret_key,
            options.session_token.clone(),
            None,
            "channel-compaction",
        ));
    }

    if let Some(endpoint_url) = &options.endpoint_url {
        loader = loader.endpoint_url(endpoint_url);
    }

    loader.load().await
}
