//! How the workflow engine reaches providers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::types::StepFailure;
use crate::supervisor::ProcessSupervisor;
use crate::value::Value;

/// Invoke an operation on a provider, starting it if needed.
#[async_trait]
pub trait CapabilityGateway: Send + Sync {
    async fn invoke(
        &self,
        provider: &str,
        operation: &str,
        input: &Value,
        timeout: Option<Duration>,
    ) -> Result<Value, StepFailure>;
}

#[async_trait]
impl CapabilityGateway for ProcessSupervisor {
    async fn invoke(
        &self,
        provider: &str,
        operation: &str,
        input: &Value,
        timeout: Option<Duration>,
    ) -> Result<Value, StepFailure> {
        self.ensure_running(provider)
            .await
            .map_err(|e| StepFailure::from_supervisor(&e))?;
        self.call(provider, operation, input, timeout)
            .await
            .map_err(|e| StepFailure::from_supervisor(&e))
    }
}

#[async_trait]
impl<G: CapabilityGateway + ?Sized> CapabilityGateway for Arc<G> {
    async fn invoke(
        &self,
        provider: &str,
        operation: &str,
        input: &Value,
        timeout: Option<Duration>,
    ) -> Result<Value, StepFailure> {
        (**self).invoke(provider, operation, input, timeout).await
    }
}
