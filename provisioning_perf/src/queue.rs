//! The subscriber-side view of the Provisioning API that a consumer pulls from
use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use provisioning_client::{Client, ProvisioningMessage};

/// A queue of messages for one subscription
#[async_trait]
pub trait MessageQueue: Debug + Send + Sync {
    /// Name of the subscription this queue belongs to
    fn subscription(&self) -> &str;

    /// Long-poll for the next message for up to `timeout`
    ///
    /// `Ok(None)` means that no message became available in time.
    async fn next(
        &self,
        timeout: Duration,
        pop: bool,
    ) -> Result<Option<ProvisioningMessage>, provisioning_client::Error>;

    /// Report the message with the given sequence number as processed
    async fn acknowledge(&self, sequence_number: u64) -> Result<(), provisioning_client::Error>;
}

#[async_trait]
impl MessageQueue for Client {
    fn subscription(&self) -> &str {
        self.username()
    }

    async fn next(
        &self,
        timeout: Duration,
        pop: bool,
    ) -> Result<Option<ProvisioningMessage>, provisioning_client::Error> {
        self.next_message().timeout(timeout).pop(pop).send().await
    }

    async fn acknowledge(&self, sequence_number: u64) -> Result<(), provisioning_client::Error> {
        Self::acknowledge(self, sequence_number).await
    }
}

#[async_trait]
impl<T: MessageQueue + ?Sized> MessageQueue for Arc<T> {
    fn subscription(&self) -> &str {
        (**self).subscription()
    }

    async fn next(
        &self,
        timeout: Duration,
        pop: bool,
    ) -> Result<Option<ProvisioningMessage>, provisioning_client::Error> {
        (**self).next(timeout, pop).await
    }

    async fn acknowledge(&self, sequence_number: u64) -> Result<(), provisioning_client::Error> {
        (**self).acknowledge(sequence_number).await
    }
}
