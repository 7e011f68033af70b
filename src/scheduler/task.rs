//! Scheduled task abstraction

use std::future::Future;

use async_trait::async_trait;

use crate::error::Result;

/// One invocation of a recurring background job.
///
/// A returned error fails only that invocation; the job keeps its schedule.
#[async_trait]
pub trait ScheduledTask: Send + Sync {
    async fn run(&self) -> Result<()>;
}

/// Adapts an async closure into a [`ScheduledTask`]
pub struct FnTask<F> {
    f: F,
}

impl<F, Fut> FnTask<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> ScheduledTask for FnTask<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn run(&self) -> Result<()> {
        (self.f)().await
    }
}
