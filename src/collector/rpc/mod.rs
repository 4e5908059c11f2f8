//! RPC-backed sources.

mod client;
mod methods;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use crate::collector::{CollectContext, CollectError, Source, SourceDescriptor, SourceKind};
use crate::storage::Sample;

pub use client::{RpcClient, RpcError};
pub use methods::RpcMethod;

/// Source wrapping one RPC method.
pub struct RpcSource {
    descriptor: SourceDescriptor,
    method: RpcMethod,
    client: Arc<RpcClient>,
}

impl RpcSource {
    pub fn new(method: RpcMethod, interval: Duration, client: Arc<RpcClient>) -> Self {
        let mut descriptor = SourceDescriptor::new(method.name(), SourceKind::Rpc, interval);
        if let Some(timeout) = method.default_timeout() {
            descriptor.timeout = timeout;
        } else {
            descriptor.timeout = descriptor.timeout.min(client.timeout());
        }
        Self {
            descriptor,
            method,
            client,
        }
    }

    pub fn method(&self) -> RpcMethod {
        self.method
    }
}

#[async_trait]
impl Source for RpcSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn collect(&mut self, ctx: &CollectContext) -> Result<Sample, CollectError> {
        let start = Instant::now();
        let result = self
            .client
            .call_with_timeout(
                self.method.name(),
                &self.method.params(),
                self.descriptor.timeout,
            )
            .await?;
        debug!(
            method = %self.method,
            duration_ms = start.elapsed().as_millis() as u64,
            "rpc call finished"
        );
        let payload = self.method.shape(result)?;
        Ok(ctx.sample(&self.descriptor, payload))
    }
}
