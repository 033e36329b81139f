// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Log Topology
//!
//! The exchange, queue and binding the appender publishes through. Declaring
//! them is idempotent at the broker, so `install` is safe to repeat after
//! every reconnect.

use crate::{
    client::BrokerChannel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use tracing::{debug, error};

/// Exchange + queue + binding, immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    exchange: ExchangeDefinition,
    queue: QueueDefinition,
    binding: QueueBinding,
}

impl Topology {
    pub fn new(exchange: ExchangeDefinition, queue: QueueDefinition, binding: QueueBinding) -> Self {
        Topology {
            exchange,
            queue,
            binding,
        }
    }

    pub fn exchange(&self) -> &ExchangeDefinition {
        &self.exchange
    }

    pub fn queue(&self) -> &QueueDefinition {
        &self.queue
    }

    pub fn binding(&self) -> &QueueBinding {
        &self.binding
    }

    /// Installs the topology on the broker through `channel`.
    ///
    /// This method performs the following operations in order:
    /// 1. Declares the exchange
    /// 2. Declares the queue
    /// 3. Binds the queue to the exchange with the routing key
    ///
    /// Stops at the first failure.
    pub async fn install(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        self.install_exchange(channel).await?;
        self.install_queue(channel).await?;
        self.binding_queue(channel).await
    }

    async fn install_exchange(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", self.exchange.name);

        if let Err(err) = channel.exchange_declare(&self.exchange).await {
            error!(
                error = err.to_string(),
                name = %self.exchange.name,
                "error to declare the exchange"
            );
            return Err(AmqpError::DeclareExchangeError(self.exchange.name.clone()));
        }

        debug!("exchange: {} was created", self.exchange.name);
        Ok(())
    }

    async fn install_queue(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        debug!("creating queue: {}", self.queue.name);

        match channel.queue_declare(&self.queue).await {
            Err(err) => {
                error!(error = err.to_string(), name = %self.queue.name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(self.queue.name.clone()))
            }
            _ => {
                debug!("queue: {} was created", self.queue.name);
                Ok(())
            }
        }
    }

    async fn binding_queue(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            self.binding.queue_name, self.binding.exchange_name, self.binding.routing_key
        );

        match channel.queue_bind(&self.binding).await {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");

                Err(AmqpError::BindingExchangeToQueueError(
                    self.binding.exchange_name.clone(),
                    self.binding.queue_name.clone(),
                ))
            }
            _ => {
                debug!("queue was bounded");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockBrokerChannel;
    use mockall::Sequence;

    fn topology() -> Topology {
        Topology::new(
            ExchangeDefinition::new("logs"),
            QueueDefinition::new("log-queue"),
            QueueBinding::new("log-queue").exchange("logs").routing_key("app"),
        )
    }

    #[tokio::test]
    async fn declares_exchange_queue_then_binding() {
        let mut channel = MockBrokerChannel::new();
        let mut seq = Sequence::new();

        channel
            .expect_exchange_declare()
            .withf(|def| def.name() == "logs")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_queue_declare()
            .withf(|def| def.name() == "log-queue" && !def.is_durable())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_queue_bind()
            .withf(|b| b.exchange_name() == "logs" && b.key() == "app")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        assert_eq!(topology().install(&channel).await, Ok(()));
    }

    #[tokio::test]
    async fn stops_at_first_failure() {
        let mut channel = MockBrokerChannel::new();

        channel
            .expect_exchange_declare()
            .returning(|_| Ok(()));
        channel
            .expect_queue_declare()
            .returning(|_| Err(AmqpError::ChannelError("closed".to_owned())));
        channel.expect_queue_bind().never();

        assert_eq!(
            topology().install(&channel).await,
            Err(AmqpError::DeclareQueueError("log-queue".to_owned()))
        );
    }
}
