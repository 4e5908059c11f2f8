//! In-memory source with a scripted sequence of outcomes.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::collector::{CollectContext, CollectError, Source, SourceDescriptor, SourceKind};
use crate::storage::Sample;

/// One scripted outcome of `collect()`.
#[derive(Debug, Clone)]
pub enum Step {
    /// Succeed with this payload.
    Ok(serde_json::Value),
    /// Fail with this error.
    Err(CollectError),
    /// Sleep for the duration, then succeed with the payload.
    Slow(Duration, serde_json::Value),
}

/// Source replaying a script, then repeating `fallback` forever.
pub struct ScriptedSource {
    descriptor: SourceDescriptor,
    script: VecDeque<Step>,
    fallback: Step,
    calls: Arc<AtomicU64>,
}

impl ScriptedSource {
    /// Creates a source that always succeeds with `payload`.
    pub fn constant(name: &str, interval: Duration, payload: serde_json::Value) -> Self {
        Self {
            descriptor: SourceDescriptor::new(name, SourceKind::Rpc, interval),
            script: VecDeque::new(),
            fallback: Step::Ok(payload),
            calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Creates a source that always fails with `error`.
    pub fn failing(name: &str, interval: Duration, error: CollectError) -> Self {
        Self {
            fallback: Step::Err(error),
            ..Self::constant(name, interval, serde_json::Value::Null)
        }
    }

    /// Prepends scripted steps played before the fallback.
    pub fn with_script(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.script = steps.into_iter().collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.descriptor.timeout = timeout;
        self
    }

    /// Shared counter of `collect()` invocations, readable after the
    /// source has been moved into the scheduler.
    pub fn call_counter(&self) -> Arc<AtomicU64> {
        self.calls.clone()
    }
}

#[async_trait]
impl Source for ScriptedSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn collect(&mut self, ctx: &CollectContext) -> Result<Sample, CollectError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match step {
            Step::Ok(payload) => Ok(ctx.sample(&self.descriptor, payload)),
            Step::Err(e) => Err(e),
            Step::Slow(delay, payload) => {
                tokio::time::sleep(delay).await;
                Ok(ctx.sample(&self.descriptor, payload))
            }
        }
    }
}
