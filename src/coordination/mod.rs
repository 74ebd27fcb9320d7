/// Coordination primitives built on the retrying executor
///
/// Expected business outcomes (lock held, quota exhausted, over budget) are
/// plain return values. Losing every store node is not an error for these
/// callers either: the operation logs and yields its neutral value.
pub mod blacklist;
pub mod lock;
pub mod quota;
pub mod rate_limiter;

pub use blacklist::{build_blacklist, Blacklist, LocalBlacklist, RemoteBlacklist};
pub use lock::DistributedLock;
pub use quota::{FlashSaleItem, QuotaAllocator};
#[allow(deprecated)]
pub use rate_limiter::SlidingWindowLimiter;
pub use rate_limiter::{RateLimiter, ThrottleDecision, ThrottleSpec};

use crate::error::{CerrojoError, CerrojoResult};
use crate::store::RespValue;

/// Map `NoMaster` onto `neutral`, pass everything else through
pub(crate) fn absorb_no_master<T>(operation: &str, result: CerrojoResult<T>, neutral: T) -> CerrojoResult<T> {
    match result {
        Err(CerrojoError::NoMaster) => {
            tracing::error!(operation = %operation, "No master elected, returning neutral result");
            Ok(neutral)
        }
        other => other,
    }
}

pub(crate) fn require_non_empty(what: &str, value: &str) -> CerrojoResult<()> {
    if value.is_empty() {
        return Err(CerrojoError::invalid_argument(format!("{} cannot be empty", what)));
    }
    Ok(())
}

/// Integer reply of a script, or an `UnexpectedReply` error
pub(crate) fn integer_reply(command: &str, reply: RespValue) -> crate::error::StoreResult<i64> {
    reply
        .as_integer()
        .ok_or_else(|| crate::error::StoreError::unexpected(command, &reply))
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::cluster::{Elector, ElectorSettings, FailoverNotifier, FailoverWorker, LogAlertSink, Node, NodeRegistry};
    use crate::executor::{RetryPolicy, RetryingExecutor};
    use crate::store::{MemoryStore, StoreClient};
    use std::sync::Arc;
    use std::time::Duration;

    /// Executor over one elected in-memory node
    pub async fn memory_executor() -> (Arc<MemoryStore>, Arc<RetryingExecutor>) {
        let store = Arc::new(MemoryStore::new());
        let client: Arc<dyn StoreClient> = store.clone();
        let registry = Arc::new(NodeRegistry::new(vec![Node::new("a", "10.0.0.1", 6379, client)]));
        let elector = Arc::new(Elector::new(registry, ElectorSettings::default()));
        elector.elect("test").await;

        let notifier = Arc::new(FailoverNotifier::new(Arc::new(LogAlertSink), Duration::from_secs(60)));
        let (handle, _task) = FailoverWorker::spawn(Arc::clone(&elector), notifier);
        let policy = RetryPolicy {
            max_retries: 1,
            backoff: Duration::from_millis(10),
        };
        (store, Arc::new(RetryingExecutor::new(elector, handle, policy)))
    }
}
