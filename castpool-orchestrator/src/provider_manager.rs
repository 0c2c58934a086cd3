use castpool_providers::CloudProvider;
use std::sync::Arc;

use crate::settings::Settings;

pub struct ProviderManager;

impl ProviderManager {
    /// Build the provider named by `CLOUD_PROVIDER`. `None` when the name is unknown,
    /// compiled out, or its credentials are missing.
    pub fn get_provider(settings: &Settings) -> Option<Arc<dyn CloudProvider>> {
        match settings.provider.as_str() {
            #[cfg(feature = "provider-ec2")]
            "ec2" | "aws" => {
                let access_key = settings.aws_access_key_id.clone()?;
                let secret_key = settings.aws_secret_access_key.clone()?;
                match castpool_providers::ec2::Ec2Provider::new(
                    &settings.region,
                    access_key,
                    secret_key,
                    settings.aws_session_token.clone(),
                ) {
                    Ok(provider) => Some(Arc::new(provider)),
                    Err(e) => {
                        tracing::error!(error = %e, "failed to build EC2 provider");
                        None
                    }
                }
            }
            #[cfg(feature = "provider-mock")]
            "mock" => Some(Arc::new(castpool_providers::mock::MockProvider::new())),
            other => {
                tracing::error!(provider = other, "unknown or disabled cloud provider");
                None
            }
        }
    }
}
