// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Link
//!
//! Owns the single connection and the single channel to the broker. Both
//! handles live in one [`LinkHandles`] value behind one async mutex: connect,
//! channel creation, topology declaration, publish and closure notifications
//! all take that lock, so the channel is never used by two tasks at once and
//! a connection is never seen valid next to a channel from an older one.
//!
//! `connect` and `open_channel` are idempotent: they return the live handle
//! if there is one and only reach the network otherwise.

use crate::{
    client::{BrokerChannel, BrokerClient, BrokerConnection, BrokerEndpoint, PublishProperties},
    counters::Counters,
    errors::AmqpError,
    shutdown::{ClosureNotifier, HandleKind},
    topology::Topology,
};
use std::sync::Arc;
use tokio::{runtime::Handle, sync::Mutex};
use tracing::{debug, warn};

/// Observable state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connected,
    ChannelOpen,
}

struct Slot<T: ?Sized> {
    generation: u64,
    handle: Arc<T>,
}

/// The connection/channel pair, always guarded as a unit.
#[derive(Default)]
pub(crate) struct LinkHandles {
    connection: Option<Slot<dyn BrokerConnection>>,
    channel: Option<Slot<dyn BrokerChannel>>,
    last_generation: u64,
    /// Connection generation the topology was last declared on
    declared_on: Option<u64>,
}

impl LinkHandles {
    fn next_generation(&mut self) -> u64 {
        self.last_generation += 1;
        self.last_generation
    }

    /// Stores a new connection, dropping any channel of the previous one.
    #[cfg(test)]
    pub(crate) fn install_connection(&mut self, handle: Arc<dyn BrokerConnection>) -> u64 {
        let generation = self.next_generation();
        self.install_connection_as(generation, handle);
        generation
    }

    #[cfg(test)]
    pub(crate) fn install_channel(&mut self, handle: Arc<dyn BrokerChannel>) -> u64 {
        let generation = self.next_generation();
        self.channel = Some(Slot { generation, handle });
        generation
    }

    fn install_connection_as(&mut self, generation: u64, handle: Arc<dyn BrokerConnection>) {
        self.channel = None;
        self.connection = Some(Slot { generation, handle });
    }

    /// Forgets the handle of `kind` if it is still the one issued as
    /// `generation`. Clearing the connection also clears its channel.
    pub(crate) fn clear(&mut self, kind: HandleKind, generation: u64) -> bool {
        match kind {
            HandleKind::Connection => {
                if self.connection.as_ref().map(|s| s.generation) != Some(generation) {
                    return false;
                }
                self.connection = None;
                self.channel = None;
                true
            }
            HandleKind::Channel => {
                if self.channel.as_ref().map(|s| s.generation) != Some(generation) {
                    return false;
                }
                self.channel = None;
                true
            }
        }
    }

    pub(crate) fn state(&self) -> LinkState {
        match (&self.connection, &self.channel) {
            (Some(conn), Some(chan)) if conn.handle.is_open() && chan.handle.is_open() => {
                LinkState::ChannelOpen
            }
            (Some(conn), _) if conn.handle.is_open() => LinkState::Connected,
            _ => LinkState::Disconnected,
        }
    }

    fn open_connection(&self) -> Option<(u64, Arc<dyn BrokerConnection>)> {
        self.connection
            .as_ref()
            .filter(|slot| slot.handle.is_open())
            .map(|slot| (slot.generation, slot.handle.clone()))
    }

    fn open_channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.channel
            .as_ref()
            .filter(|slot| slot.handle.is_open())
            .map(|slot| slot.handle.clone())
    }
}

/// Single logical connection + channel to the broker.
pub struct BrokerLink {
    client: Arc<dyn BrokerClient>,
    endpoint: BrokerEndpoint,
    topology: Topology,
    handles: Arc<Mutex<LinkHandles>>,
    counters: Arc<Counters>,
    runtime: Handle,
}

impl BrokerLink {
    /// Creates an empty link. Nothing is opened until `connect`.
    ///
    /// `runtime` is where closure notifications get applied.
    pub fn new(
        client: Arc<dyn BrokerClient>,
        endpoint: BrokerEndpoint,
        topology: Topology,
        counters: Arc<Counters>,
        runtime: Handle,
    ) -> Self {
        BrokerLink {
            client,
            endpoint,
            topology,
            handles: Arc::new(Mutex::new(LinkHandles::default())),
            counters,
            runtime,
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub async fn state(&self) -> LinkState {
        self.handles.lock().await.state()
    }

    /// Returns the open connection, establishing a new one if needed.
    pub async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut handles = self.handles.lock().await;
        self.ensure_connection(&mut handles).await
    }

    /// Returns the open channel, creating one on the live connection if
    /// needed. Fails with `NotConnected` when there is no live connection.
    pub async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut handles = self.handles.lock().await;
        self.ensure_channel(&mut handles).await
    }

    /// Declares exchange, queue and binding on the open channel.
    pub async fn declare_topology(&self) -> Result<(), AmqpError> {
        let mut handles = self.handles.lock().await;
        let channel = handles.open_channel().ok_or(AmqpError::NotConnected)?;
        let generation = handles.open_connection().map(|(generation, _)| generation);

        self.topology.install(channel.as_ref()).await?;
        handles.declared_on = generation;
        Ok(())
    }

    /// Sends one message on the open channel. Does not reconnect or retry.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: &PublishProperties,
        payload: &[u8],
    ) -> Result<(), AmqpError> {
        let handles = self.handles.lock().await;
        let channel = handles.open_channel().ok_or(AmqpError::NotConnected)?;

        channel
            .basic_publish(exchange, routing_key, properties, payload)
            .await
    }

    /// One delivery attempt: connect, open the channel, redeclare the
    /// topology on a connection it was never declared on, then publish to the
    /// configured exchange. The lock is held for the whole attempt.
    pub async fn publish_to_topology(
        &self,
        properties: &PublishProperties,
        payload: &[u8],
    ) -> Result<(), AmqpError> {
        let mut handles = self.handles.lock().await;

        self.ensure_connection(&mut handles).await?;
        let channel = self.ensure_channel(&mut handles).await?;
        self.redeclare_on_new_connection(&mut handles, channel.as_ref())
            .await;

        let binding = self.topology.binding();
        channel
            .basic_publish(binding.exchange_name(), binding.key(), properties, payload)
            .await
    }

    /// Closes the channel if it is open. The handle is dropped either way.
    pub async fn close_channel(&self) -> Result<(), AmqpError> {
        let mut handles = self.handles.lock().await;
        match handles.channel.take() {
            Some(slot) if slot.handle.is_open() => {
                debug!("closing amqp channel");
                slot.handle.close().await
            }
            _ => Ok(()),
        }
    }

    /// Closes the connection if it is open. The handle is dropped either way.
    pub async fn close_connection(&self) -> Result<(), AmqpError> {
        let mut handles = self.handles.lock().await;
        handles.channel = None;
        match handles.connection.take() {
            Some(slot) if slot.handle.is_open() => {
                debug!("closing amqp connection");
                slot.handle.close().await
            }
            _ => Ok(()),
        }
    }

    fn notifier(&self, kind: HandleKind, generation: u64) -> ClosureNotifier {
        ClosureNotifier::new(&self.handles, self.runtime.clone(), kind, generation)
    }

    async fn ensure_connection(
        &self,
        handles: &mut LinkHandles,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        if let Some((_, connection)) = handles.open_connection() {
            return Ok(connection);
        }

        debug!("creating amqp connection...");
        let generation = handles.next_generation();
        let connection = self
            .client
            .connect(&self.endpoint, self.notifier(HandleKind::Connection, generation))
            .await?;

        self.counters.record_reconnection();
        handles.install_connection_as(generation, connection.clone());
        debug!(generation, "amqp connected");

        Ok(connection)
    }

    async fn ensure_channel(
        &self,
        handles: &mut LinkHandles,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if let Some(channel) = handles.open_channel() {
            return Ok(channel);
        }

        handles.channel = None;
        let (_, connection) = handles.open_connection().ok_or(AmqpError::NotConnected)?;

        debug!("creating amqp channel...");
        let generation = handles.next_generation();
        let channel = connection
            .create_channel(self.notifier(HandleKind::Channel, generation))
            .await?;

        handles.channel = Some(Slot {
            generation,
            handle: channel.clone(),
        });
        debug!(generation, "channel created");

        Ok(channel)
    }

    async fn redeclare_on_new_connection(
        &self,
        handles: &mut LinkHandles,
        channel: &dyn BrokerChannel,
    ) {
        let Some((generation, _)) = handles.open_connection() else {
            return;
        };
        if handles.declared_on == Some(generation) {
            return;
        }

        // Marked before trying: a failed declare closes the channel, and
        // retrying it on every reopen would wedge delivery.
        handles.declared_on = Some(generation);
        if let Err(err) = self.topology.install(channel).await {
            warn!(error = err.to_string(), "failure to redeclare topology after reconnect");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::{MockBrokerChannel, MockBrokerClient, MockBrokerConnection},
        configs::AppenderConfigs,
    };
    use std::sync::Mutex as StdMutex;

    fn healthy_channel() -> MockBrokerChannel {
        let mut channel = MockBrokerChannel::new();
        channel.expect_is_open().return_const(true);
        channel.expect_exchange_declare().returning(|_| Ok(()));
        channel.expect_queue_declare().returning(|_| Ok(()));
        channel.expect_queue_bind().returning(|_| Ok(()));
        channel.expect_basic_publish().returning(|_, _, _, _| Ok(()));
        channel
    }

    fn connection_with_channels(
        open: bool,
        notifiers: Arc<StdMutex<Vec<ClosureNotifier>>>,
    ) -> MockBrokerConnection {
        let mut connection = MockBrokerConnection::new();
        connection.expect_is_open().return_const(open);
        connection.expect_create_channel().returning(move |notifier| {
            notifiers.lock().unwrap().push(notifier);
            Ok(Arc::new(healthy_channel()) as Arc<dyn BrokerChannel>)
        });
        connection
    }

    fn link(client: MockBrokerClient, counters: Arc<Counters>) -> BrokerLink {
        let configs = AppenderConfigs::default();
        BrokerLink::new(
            Arc::new(client),
            configs.endpoint().unwrap(),
            configs.topology(),
            counters,
            Handle::current(),
        )
    }

    #[tokio::test]
    async fn connect_is_idempotent_while_open() {
        let mut client = MockBrokerClient::new();
        client.expect_connect().times(1).returning(|_, _| {
            let conn = connection_with_channels(true, Default::default());
            Ok(Arc::new(conn) as Arc<dyn BrokerConnection>)
        });

        let counters = Arc::new(Counters::default());
        let link = link(client, counters.clone());

        link.connect().await.unwrap();
        link.connect().await.unwrap();
        link.open_channel().await.unwrap();
        link.open_channel().await.unwrap();

        assert_eq!(counters.reconnections(), 1);
        assert_eq!(link.state().await, LinkState::ChannelOpen);
    }

    #[tokio::test]
    async fn closed_connection_is_replaced() {
        let mut client = MockBrokerClient::new();
        client.expect_connect().times(2).returning(|_, _| {
            let conn = connection_with_channels(false, Default::default());
            Ok(Arc::new(conn) as Arc<dyn BrokerConnection>)
        });

        let counters = Arc::new(Counters::default());
        let link = link(client, counters.clone());

        link.connect().await.unwrap();
        link.connect().await.unwrap();

        assert_eq!(counters.reconnections(), 2);
    }

    #[tokio::test]
    async fn failed_connect_does_not_count() {
        let mut client = MockBrokerClient::new();
        client
            .expect_connect()
            .returning(|_, _| Err(AmqpError::ConnectionError("refused".to_owned())));

        let counters = Arc::new(Counters::default());
        let link = link(client, counters.clone());

        assert!(matches!(
            link.connect().await,
            Err(AmqpError::ConnectionError(_))
        ));
        assert_eq!(counters.reconnections(), 0);
        assert_eq!(link.state().await, LinkState::Disconnected);
    }

    #[tokio::test]
    async fn channel_requires_connection() {
        let mut client = MockBrokerClient::new();
        client.expect_connect().never();

        let link = link(client, Arc::new(Counters::default()));

        assert!(matches!(
            link.open_channel().await,
            Err(AmqpError::NotConnected)
        ));
        assert!(matches!(
            link.declare_topology().await,
            Err(AmqpError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn publish_reopens_channel_after_closure_notification() {
        let notifiers = Arc::new(StdMutex::new(Vec::new()));
        let for_client = notifiers.clone();

        let mut client = MockBrokerClient::new();
        client.expect_connect().times(1).returning(move |_, _| {
            let conn = connection_with_channels(true, for_client.clone());
            Ok(Arc::new(conn) as Arc<dyn BrokerConnection>)
        });

        let link = link(client, Arc::new(Counters::default()));
        let properties = PublishProperties::default();

        link.publish_to_topology(&properties, b"first").await.unwrap();

        let notifier = notifiers.lock().unwrap()[0].clone();
        assert_eq!(notifier.kind(), HandleKind::Channel);
        assert!(notifier.apply().await);
        assert_eq!(link.state().await, LinkState::Connected);

        link.publish_to_topology(&properties, b"second").await.unwrap();

        assert_eq!(notifiers.lock().unwrap().len(), 2);
        assert_eq!(link.state().await, LinkState::ChannelOpen);
    }

    #[tokio::test]
    async fn topology_is_declared_once_per_connection() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_is_open().return_const(true);
        channel.expect_exchange_declare().times(1).returning(|_| Ok(()));
        channel.expect_queue_declare().times(1).returning(|_| Ok(()));
        channel.expect_queue_bind().times(1).returning(|_| Ok(()));
        channel
            .expect_basic_publish()
            .withf(|exchange, _, _, payload| exchange == "amqp-exchange" && !payload.is_empty())
            .times(3)
            .returning(|_, _, _, _| Ok(()));
        let channel: Arc<dyn BrokerChannel> = Arc::new(channel);

        let mut connection = MockBrokerConnection::new();
        connection.expect_is_open().return_const(true);
        connection
            .expect_create_channel()
            .times(1)
            .returning(move |_| Ok(channel.clone()));
        let connection: Arc<dyn BrokerConnection> = Arc::new(connection);

        let mut client = MockBrokerClient::new();
        client
            .expect_connect()
            .times(1)
            .returning(move |_, _| Ok(connection.clone()));

        let link = link(client, Arc::new(Counters::default()));
        let properties = PublishProperties::default();

        for _ in 0..3 {
            link.publish_to_topology(&properties, b"payload").await.unwrap();
        }
    }

    #[tokio::test]
    async fn close_skips_handles_that_are_not_open() {
        let mut client = MockBrokerClient::new();
        client.expect_connect().never();

        let link = link(client, Arc::new(Counters::default()));

        assert_eq!(link.close_channel().await, Ok(()));
        assert_eq!(link.close_connection().await, Ok(()));
    }
}
