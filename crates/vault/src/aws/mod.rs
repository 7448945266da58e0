//! AWS SDK client initialisation for KMS and S3.
//!
//! Clients are built once at startup and handed to the components that need
//! them ([`crate::kms::AwsKms`], [`crate::snapshot::S3Sink`]); nothing reads
//! AWS settings from globals.

pub mod clients;

pub use clients::AwsClients;
