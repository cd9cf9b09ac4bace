use std::sync::Arc;
use std::time::{Duration, Instant};

use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use crate::batch::{Batch, BatchBuilder, DEFAULT_MAX_BATCH_SIZE_BYTES};
use crate::connection::{self, AttemptError};
use crate::credentials::CredentialProvider;
use crate::endpoint::{AppendAck, StreamConnection, StreamEndpoint};
use crate::error::{Error, Result};
use crate::metrics_consts::{RECORDS_SENT, SEND_DURATION, SEND_FAILURES, SEND_RETRIES};
use crate::record::{PartitionId, PartitionTarget, Record};
use crate::retry::RetryPolicy;

#[derive(Clone, Debug)]
pub struct ProducerConfig {
    pub max_batch_size_bytes: usize,
    pub retry_policy: RetryPolicy,
    pub connect_timeout: Duration,
    /// How long to wait for the stream to acknowledge one send attempt.
    pub send_timeout: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            max_batch_size_bytes: DEFAULT_MAX_BATCH_SIZE_BYTES,
            retry_policy: RetryPolicy::default(),
            connect_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(60),
        }
    }
}

/// Where the stream put a send, and how many attempts it took.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendReceipt {
    pub partition: PartitionId,
    pub first_offset: u64,
    pub last_offset: u64,
    pub enqueued_at: OffsetDateTime,
    pub record_count: usize,
    pub attempts: u32,
}

/// A session sending records to one stream over a single connection.
///
/// Sends are serialized: a second caller waits until the first send is acknowledged or has
/// failed terminally. Transient failures are retried with the configured backoff, and a lost
/// connection is re-established before the in-flight send is retried.
pub struct Producer {
    endpoint: Arc<dyn StreamEndpoint>,
    credentials: Arc<dyn CredentialProvider>,
    config: ProducerConfig,
    connection: Mutex<Option<Box<dyn StreamConnection>>>,
    cancel: CancellationToken,
}

impl Producer {
    pub fn new(
        endpoint: Arc<dyn StreamEndpoint>,
        credentials: Arc<dyn CredentialProvider>,
        config: ProducerConfig,
    ) -> Self {
        Self {
            endpoint,
            credentials,
            config,
            connection: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling `cancel` aborts waits on connect, acknowledgment and backoff, and drops the
    /// connection.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    pub fn create_batch(&self) -> BatchBuilder {
        BatchBuilder::new(self.config.max_batch_size_bytes)
    }

    pub fn create_batch_for(&self, target: PartitionTarget) -> BatchBuilder {
        self.create_batch().with_target(target)
    }

    pub async fn partition_ids(&self) -> Result<Vec<PartitionId>> {
        let mut slot = self.connection.lock().await;
        if slot.is_none() {
            *slot = Some(self.connect().await?);
        }
        let Some(connection) = slot.as_ref() else {
            return Err(Error::invalid_state("producer connection missing"));
        };
        let properties = connection
            .stream_properties()
            .await
            .map_err(Error::Endpoint)?;
        Ok(properties.partition_ids)
    }

    pub async fn send_record(&self, record: Record, target: PartitionTarget) -> Result<SendReceipt> {
        self.send(&target, std::slice::from_ref(&record)).await
    }

    pub async fn send_batch(&self, batch: Batch) -> Result<SendReceipt> {
        if batch.is_empty() {
            return Err(Error::EmptyBatch);
        }
        self.send(batch.target(), batch.records()).await
    }

    /// Close the underlying connection. A later send opens a new one.
    pub async fn close(&self) {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.take() {
            connection.close().await;
            debug!(stream = self.endpoint.stream_name(), "producer connection closed");
        }
    }

    async fn connect(&self) -> Result<Box<dyn StreamConnection>> {
        match connection::open(
            self.endpoint.as_ref(),
            self.credentials.as_ref(),
            self.config.connect_timeout,
            &self.cancel,
            "producer",
        )
        .await
        {
            Ok(connection) => Ok(connection),
            Err(AttemptError::Endpoint(error)) => Err(Error::Endpoint(error)),
            Err(AttemptError::Terminal(error)) => Err(error),
        }
    }

    #[instrument(skip_all, fields(stream = self.endpoint.stream_name(), records = records.len()))]
    async fn send(&self, target: &PartitionTarget, records: &[Record]) -> Result<SendReceipt> {
        if records.is_empty() {
            return Err(Error::EmptyBatch);
        }
        let started = Instant::now();
        let mut slot = self.connection.lock().await;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match self.attempt(&mut slot, target, records).await {
                Ok(ack) => {
                    metrics::counter!(RECORDS_SENT).increment(records.len() as u64);
                    metrics::histogram!(SEND_DURATION).record(started.elapsed().as_secs_f64());
                    debug!(
                        partition = ack.partition,
                        first_offset = ack.first_offset,
                        last_offset = ack.last_offset,
                        attempt,
                        "send acknowledged"
                    );
                    return Ok(SendReceipt {
                        partition: ack.partition,
                        first_offset: ack.first_offset,
                        last_offset: ack.last_offset,
                        enqueued_at: ack.enqueued_at,
                        record_count: records.len(),
                        attempts: attempt,
                    });
                }
                Err(AttemptError::Terminal(error)) => {
                    // The state of the connection is unknown after a timeout or cancellation.
                    if matches!(error, Error::AckTimeout(_) | Error::Cancelled) {
                        release(&mut slot).await;
                    }
                    return Err(fail(error));
                }
                Err(AttemptError::Endpoint(error)) => error,
            };

            if error.is_connection_loss() {
                warn!(error = %error, "connection lost during send, reconnecting");
                release(&mut slot).await;
            }
            if !error.is_retryable() {
                return Err(fail(Error::RejectedSendFailure(error)));
            }
            if !self.config.retry_policy.should_retry(attempt) {
                return Err(fail(Error::TransientSendFailure {
                    attempts: attempt,
                    last: error,
                }));
            }

            let interval = self
                .config
                .retry_policy
                .retry_interval(attempt, error.retry_after());
            warn!(attempt, ?interval, error = %error, "send failed, retrying");
            metrics::counter!(SEND_RETRIES).increment(1);

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    release(&mut slot).await;
                    return Err(fail(Error::Cancelled));
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn attempt(
        &self,
        slot: &mut Option<Box<dyn StreamConnection>>,
        target: &PartitionTarget,
        records: &[Record],
    ) -> std::result::Result<AppendAck, AttemptError> {
        if slot.is_none() {
            let connection = connection::open(
                self.endpoint.as_ref(),
                self.credentials.as_ref(),
                self.config.connect_timeout,
                &self.cancel,
                "producer",
            )
            .await?;
            *slot = Some(connection);
        }
        let Some(connection) = slot.as_ref() else {
            return Err(Error::invalid_state("producer connection missing").into());
        };

        let timeout = self.config.send_timeout;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled.into()),
            result = tokio::time::timeout(timeout, connection.append(target, records)) => match result {
                Ok(Ok(ack)) => Ok(ack),
                Ok(Err(error)) => Err(AttemptError::Endpoint(error)),
                Err(_) => Err(Error::AckTimeout(timeout).into()),
            },
        }
    }
}

async fn release(slot: &mut Option<Box<dyn StreamConnection>>) {
    if let Some(connection) = slot.take() {
        connection.close().await;
    }
}

fn fail(error: Error) -> Error {
    error!(error = %error, "send failed");
    let labels = [("kind", error.kind())];
    metrics::counter!(SEND_FAILURES, &labels).increment(1);
    error
}

/// Fills batches and sends each one as soon as the next record no longer fits.
pub struct BatchingSender<'a> {
    producer: &'a Producer,
    current: BatchBuilder,
    receipts: Vec<SendReceipt>,
}

impl<'a> BatchingSender<'a> {
    pub fn new(producer: &'a Producer, target: PartitionTarget) -> Self {
        Self {
            producer,
            current: producer.create_batch_for(target),
            receipts: Vec::new(),
        }
    }

    /// Queue a record, sending the current batch first if the record does not fit.
    pub async fn add(&mut self, record: Record) -> Result<()> {
        let record = match self.current.try_add(record) {
            Ok(()) => return Ok(()),
            Err(record) => record,
        };
        if !self.current.fits_empty(&record) {
            return Err(Error::RecordTooLarge {
                size: record.encoded_len(),
                max: self.current.max_size_bytes(),
            });
        }

        self.flush().await?;
        self.current.try_add(record).map_err(|record| Error::RecordTooLarge {
            size: record.encoded_len(),
            max: self.current.max_size_bytes(),
        })
    }

    /// Send whatever is pending.
    pub async fn flush(&mut self) -> Result<()> {
        if self.current.is_empty() {
            return Ok(());
        }
        let batch = self.current.seal();
        debug!(records = batch.len(), bytes = batch.size_bytes(), "sending full batch");
        let receipt = self.producer.send_batch(batch).await?;
        self.receipts.push(receipt);
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.current.len()
    }

    /// Receipts of every batch sent so far, in send order.
    pub fn receipts(&self) -> &[SendReceipt] {
        &self.receipts
    }

    /// Flush and return all receipts.
    pub async fn finish(mut self) -> Result<Vec<SendReceipt>> {
        self.flush().await?;
        Ok(self.receipts)
    }
}
