use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::BoxError;

/// Runs once, in registration order, before any [`Service`] starts.
#[async_trait]
pub trait Initializer: Send + Sync {
    async fn initialize_daemon(&self) -> Result<(), BoxError>;

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Long-running work. Must return promptly once `token` is cancelled.
#[async_trait]
pub trait Service: Send + Sync {
    async fn serve(&self, token: CancellationToken);
}

/// Runs once on shutdown. Every terminator runs even if an earlier one fails.
#[async_trait]
pub trait Terminator: Send + Sync {
    async fn terminate_daemon(&self) -> Result<(), BoxError>;

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}
