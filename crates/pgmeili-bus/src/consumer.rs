use std::collections::HashMap;
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use pgmeili_core::{format_lsn, record, ChangeHandler, RouteOutcome, WalChange, WalRouter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::BusResult;

const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// One message received from a durable subscription.
pub trait Delivery: Send + 'static {
    fn payload(&self) -> &[u8];

    /// Tell the bus the message is done with. Unacknowledged messages are
    /// redelivered.
    fn ack(self) -> impl Future<Output = BusResult<()>> + Send;
}

/// Applies changes read from the bus.
///
/// Deliveries are read in order and fanned out to one bounded queue per
/// table. Each queue has a single worker, so changes to one table are
/// applied in the order they were published while different tables proceed
/// independently. A delivery is acknowledged only after its handler returns.
pub struct ChangeConsumer<H> {
    router: Arc<WalRouter<H>>,
    queue_capacity: usize,
}

struct Worker<D> {
    queue: mpsc::Sender<(WalChange, D)>,
    handle: JoinHandle<()>,
}

impl<H> ChangeConsumer<H>
where
    H: ChangeHandler + 'static,
{
    pub fn new(router: Arc<WalRouter<H>>) -> Self {
        Self {
            router,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Consume until the stream ends or `cancel` fires, then let every
    /// worker finish the changes it already holds.
    pub async fn run<S, D>(&self, deliveries: S, cancel: CancellationToken) -> BusResult<()>
    where
        S: Stream<Item = BusResult<D>> + Send,
        D: Delivery,
    {
        let mut deliveries = pin!(deliveries);
        let mut workers: HashMap<String, Worker<D>> = HashMap::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Bus consumer cancelled");
                    break;
                }
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    warn!(error = %e, "Failed to receive from bus");
                    continue;
                }
                None => {
                    info!("Bus subscription ended");
                    break;
                }
            };

            let change = match record::decode(delivery.payload()) {
                Ok(change) => change,
                Err(e) => {
                    warn!(error = %e, "Dropping undecodable bus message");
                    ack(delivery, None).await;
                    continue;
                }
            };

            let table = change.qualified_table();
            if self.router.handler_for(&table).is_none() {
                debug!(table = %table, lsn = %format_lsn(change.lsn), "No handler for table, acking");
                ack(delivery, Some(&change)).await;
                continue;
            }

            let worker = workers
                .entry(table.clone())
                .or_insert_with(|| self.spawn_worker(&table));
            if let Err(mpsc::error::SendError((change, _))) =
                worker.queue.send((change, delivery)).await
            {
                // Left unacked; the bus redelivers it.
                warn!(
                    table = %table,
                    lsn = %format_lsn(change.lsn),
                    "Table worker stopped, leaving message for redelivery"
                );
            }
        }

        let count = workers.len();
        for (table, worker) in workers {
            drop(worker.queue);
            if let Err(e) = worker.handle.await {
                warn!(table = %table, error = %e, "Table worker panicked");
            }
        }
        debug!(workers = count, "Bus consumer drained");
        Ok(())
    }

    fn spawn_worker<D: Delivery>(&self, table: &str) -> Worker<D> {
        let (queue, mut inbox) = mpsc::channel::<(WalChange, D)>(self.queue_capacity);
        let router = self.router.clone();
        debug!(table, "Starting table worker");

        let handle = tokio::spawn(async move {
            while let Some((change, delivery)) = inbox.recv().await {
                if let RouteOutcome::Failed(e) = router.dispatch(&change).await {
                    warn!(
                        table = %change.qualified_table(),
                        kind = %change.kind,
                        lsn = %format_lsn(change.lsn),
                        error = %e,
                        "Failed to sync change"
                    );
                }
                ack(delivery, Some(&change)).await;
            }
        });

        Worker { queue, handle }
    }
}

async fn ack<D: Delivery>(delivery: D, change: Option<&WalChange>) {
    if let Err(e) = delivery.ack().await {
        match change {
            Some(change) => warn!(
                table = %change.qualified_table(),
                lsn = %format_lsn(change.lsn),
                error = %e,
                "Failed to ack bus message"
            ),
            None => warn!(error = %e, "Failed to ack bus message"),
        }
    }
}
