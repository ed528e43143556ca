use async_trait::async_trait;

use super::TransferContext;
use crate::TransferError;
use crate::model::{Task, TaskChain};

/// Executes a rule's task chain.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(
        &self,
        chain: TaskChain,
        tasks: &[Task],
        ctx: &TransferContext,
    ) -> Result<(), TransferError>;
}

/// Runs nothing; every task is logged and reported as successful.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTaskRunner;

#[async_trait]
impl TaskRunner for NoopTaskRunner {
    async fn run(
        &self,
        chain: TaskChain,
        tasks: &[Task],
        ctx: &TransferContext,
    ) -> Result<(), TransferError> {
        for (idx, task) in tasks.iter().enumerate() {
            tracing::debug!(
                "transfer {}: skipping {chain} task #{idx} ({})",
                ctx.transfer.id,
                task.kind
            );
        }
        Ok(())
    }
}
