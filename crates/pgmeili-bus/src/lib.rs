//! Optional message bus between the replication loop and the index handlers.
//!
//! `ChangeDistributor` publishes encoded changes without waiting for the bus;
//! `ChangeConsumer` reads them back from a durable subscription and applies
//! them per table, acknowledging each one only after its handler returns.

mod consumer;
mod distributor;
mod error;
mod jetstream;

pub use consumer::{ChangeConsumer, Delivery};
pub use distributor::{ChangeDistributor, ChangePublisher};
pub use error::{BusError, BusResult};
pub use jetstream::{BusConfig, JetStreamBus, JetStreamDelivery, JetStreamPublisher};
