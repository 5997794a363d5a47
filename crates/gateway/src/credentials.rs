use std::sync::Arc;

use urgent_contracts::Operator;
use urgent_contracts::normalize::{non_empty, normalize_badge};
use urgent_store::OperatorDirectory;

use crate::lifecycle::LifecycleError;

/// Resolves a badge + secret pair to an operator identity.
#[derive(Clone)]
pub struct CredentialVerifier {
    directory: Arc<dyn OperatorDirectory>,
}

impl CredentialVerifier {
    pub fn new(directory: Arc<dyn OperatorDirectory>) -> Self {
        Self { directory }
    }

    /// `badge_field` names the request field in the error message.
    pub async fn verify(
        &self,
        badge: Option<&str>,
        secret: Option<&str>,
        badge_field: &'static str,
    ) -> Result<Operator, LifecycleError> {
        let badge = non_empty(badge)
            .map(|b| normalize_badge(&b))
            .ok_or_else(|| LifecycleError::BadRequest(format!("{} is required", badge_field)))?;
        let secret = non_empty(secret)
            .ok_or_else(|| LifecycleError::BadRequest("password is required".to_string()))?;

        match self.directory.find_by_credentials(&badge, &secret).await? {
            Some(operator) => Ok(operator),
            None => {
                tracing::info!(badge = %badge, "credential check rejected");
                Err(LifecycleError::Unauthorized)
            }
        }
    }
}
