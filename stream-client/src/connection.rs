use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::credentials::CredentialProvider;
use crate::endpoint::{EndpointError, StreamConnection, StreamEndpoint};
use crate::error::Error;
use crate::metrics_consts::CONNECTIONS_OPENED;

/// Outcome of one attempt against the endpoint: either something the retry loop can classify,
/// or an error that ends the operation right away.
#[derive(Debug)]
pub(crate) enum AttemptError {
    Endpoint(EndpointError),
    Terminal(Error),
}

impl From<Error> for AttemptError {
    fn from(error: Error) -> Self {
        AttemptError::Terminal(error)
    }
}

/// Fetch a token and open a connection, bounded by `timeout` and interrupted by `cancel`.
pub(crate) async fn open(
    endpoint: &dyn StreamEndpoint,
    credentials: &dyn CredentialProvider,
    timeout: Duration,
    cancel: &CancellationToken,
    role: &'static str,
) -> Result<Box<dyn StreamConnection>, AttemptError> {
    let token = credentials.get_token().await?;

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AttemptError::Terminal(Error::Cancelled)),
        result = tokio::time::timeout(timeout, endpoint.connect(&token)) => match result {
            Ok(Ok(connection)) => {
                let labels = [("role", role)];
                metrics::counter!(CONNECTIONS_OPENED, &labels).increment(1);
                info!(
                    namespace = endpoint.namespace(),
                    stream = endpoint.stream_name(),
                    role,
                    "connected to stream"
                );
                Ok(connection)
            }
            Ok(Err(error)) => Err(AttemptError::Endpoint(error)),
            Err(_) => Err(AttemptError::Terminal(Error::ConnectTimeout(timeout))),
        },
    }
}
