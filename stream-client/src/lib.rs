pub mod batch;
pub mod checkpoint;
pub mod codec;
mod connection;
pub mod consumer;
pub mod coordinator;
pub mod credentials;
pub mod endpoint;
pub mod error;
pub mod memory;
pub mod metrics_consts;
pub mod producer;
pub mod receiver;
pub mod record;
pub mod retry;
pub mod strategy;

pub use batch::{Batch, BatchBuilder};
pub use checkpoint::{Checkpoint, CheckpointOutcome, CheckpointStore};
pub use consumer::{ConsumerClient, ConsumerConfig};
pub use coordinator::{Coordinator, CoordinatorConfig, PartitionOwner};
pub use credentials::{CredentialProvider, StaticCredential};
pub use error::{Error, Result};
pub use memory::MemoryEndpoint;
pub use producer::{BatchingSender, Producer, ProducerConfig, SendReceipt};
pub use receiver::{
    CheckpointPolicy, PartitionContext, PartitionReceiver, ReceiverConfig, ReceiverState,
    RecordHandler, StartPosition,
};
pub use record::{PartitionId, PartitionTarget, PropertyValue, ReceivedRecord, Record};
