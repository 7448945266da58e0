//! AWS SDK client bundle sharing one resolved SDK configuration.

use aws_config::BehaviorVersion;

/// Bundle of AWS SDK clients used by the KMS backend and the snapshot sink.
///
/// Both clients share the same underlying [`aws_config::SdkConfig`] so that
/// credentials and region are resolved once and reused.
#[derive(Clone)]
pub struct AwsClients {
    /// KMS client used to wrap and unwrap tenant DEKs.
    pub kms: aws_sdk_kms::Client,
    /// S3 client used to persist snapshot payloads.
    pub s3: aws_sdk_s3::Client,
}

impl AwsClients {
    /// Initialise all AWS SDK clients from the standard credential chain.
    ///
    /// `kms_endpoint_url` overrides the KMS endpoint (e.g. a VPC endpoint or a
    /// local KMS emulator).
    pub async fn init(kms_endpoint_url: Option<&str>) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;

        let mut kms_config = aws_sdk_kms::config::Builder::from(&config);
        if let Some(url) = kms_endpoint_url {
            kms_config = kms_config.endpoint_url(url);
        }
        let kms = aws_sdk_kms::Client::from_conf(kms_config.build());

        let s3 = aws_sdk_s3::Client::new(&config);

        Self { kms, s3 }
    }
}
