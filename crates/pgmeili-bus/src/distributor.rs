use std::future::Future;

use bytes::Bytes;
use pgmeili_core::{format_lsn, record, ChangeSink, WalChange};
use tracing::{trace, warn};

use crate::error::BusResult;

/// Hands an encoded change to the bus.
///
/// Must return once the payload is queued on the connection; waiting for the
/// bus to confirm storage belongs on a background task.
pub trait ChangePublisher: Send + Sync {
    fn publish(&self, payload: Bytes) -> impl Future<Output = BusResult<()>> + Send;
}

/// Re-publishes every decoded change onto the bus.
///
/// Sits where the router would otherwise be as the replication loop's sink.
/// Failures are logged and the change is dropped, so the cursor keeps
/// moving whatever the bus does.
pub struct ChangeDistributor<P> {
    publisher: P,
}

impl<P: ChangePublisher> ChangeDistributor<P> {
    pub fn new(publisher: P) -> Self {
        Self { publisher }
    }
}

impl<P: ChangePublisher> ChangeSink for ChangeDistributor<P> {
    async fn deliver(&self, change: WalChange) {
        let payload = match record::encode(&change) {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                warn!(
                    table = %change.qualified_table(),
                    kind = %change.kind,
                    lsn = %format_lsn(change.lsn),
                    error = %e,
                    "Failed to encode change for the bus"
                );
                return;
            }
        };

        match self.publisher.publish(payload).await {
            Ok(()) => trace!(
                table = %change.qualified_table(),
                lsn = %format_lsn(change.lsn),
                "Published change"
            ),
            Err(e) => warn!(
                table = %change.qualified_table(),
                kind = %change.kind,
                lsn = %format_lsn(change.lsn),
                error = %e,
                "Failed to publish change"
            ),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::BusError;
    use pgmeili_core::{ChangeKind, Value};
    use std::sync::{Arc, Mutex};

    /// Publisher that keeps payloads in memory.
    #[derive(Clone, Default)]
    pub(crate) struct MemoryPublisher {
        pub(crate) published: Arc<Mutex<Vec<Bytes>>>,
        pub(crate) fail: bool,
    }

    impl ChangePublisher for MemoryPublisher {
        async fn publish(&self, payload: Bytes) -> BusResult<()> {
            if self.fail {
                return Err(BusError::Publish("no responders".into()));
            }
            self.published.lock().unwrap().push(payload);
            Ok(())
        }
    }

    pub(crate) fn insert(table: &str, id: i64, lsn: u64) -> WalChange {
        let mut change = WalChange::new(ChangeKind::Insert, "public", table);
        change.column_names = vec!["id".into(), "body".into()];
        change.column_values = vec![Value::Int(id), Value::UnchangedToast];
        change.lsn = lsn;
        change
    }

    #[tokio::test]
    async fn test_publishes_in_order() {
        let publisher = MemoryPublisher::default();
        let distributor = ChangeDistributor::new(publisher.clone());

        distributor.deliver(insert("users", 1, 10)).await;
        distributor.deliver(insert("orders", 2, 20)).await;

        let published = publisher.published.lock().unwrap().clone();
        assert_eq!(published.len(), 2);

        let first = record::decode(&published[0]).unwrap();
        assert_eq!(first, insert("users", 1, 10));
        assert_eq!(first.column_values[1], Value::UnchangedToast);
        assert_eq!(record::decode(&published[1]).unwrap().lsn, 20);
    }

    #[tokio::test]
    async fn test_publish_failure_is_swallowed() {
        let publisher = MemoryPublisher {
            fail: true,
            ..Default::default()
        };
        let distributor = ChangeDistributor::new(publisher.clone());

        distributor.deliver(insert("users", 1, 10)).await;
        assert!(publisher.published.lock().unwrap().is_empty());
    }
}
