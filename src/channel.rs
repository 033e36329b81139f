// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! Production [`BrokerClient`] backed by `lapin`. Connections are opened with
//! the application name as connection name, and both connections and
//! channels fire their [`ClosureNotifier`] from lapin's error callback when
//! the broker or the network closes them.
//!
//! [`TlsPolicy::TrustAll`] endpoints are reached over a plain socket that is
//! upgraded with a rustls connector accepting any server certificate.

use crate::{
    client::{BrokerChannel, BrokerClient, BrokerConnection, BrokerEndpoint, PublishProperties},
    configs::TlsPolicy,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    shutdown::ClosureNotifier,
};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    tcp::{AMQPUriTcpExt, OwnedTLSConfig, RustlsConnector},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    uri::{AMQPScheme, AMQPUri},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{self, CryptoProvider},
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, SignatureScheme,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::debug;

const REPLY_SUCCESS: u16 = 200;

/// Opens `lapin` connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct LapinBrokerClient;

impl LapinBrokerClient {
    pub fn new() -> Arc<LapinBrokerClient> {
        Arc::new(LapinBrokerClient)
    }
}

#[async_trait]
impl BrokerClient for LapinBrokerClient {
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        notifier: ClosureNotifier,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(endpoint.connection_name.clone()));

        let conn = match endpoint.tls {
            TlsPolicy::TrustAll => Self::connect_trusting_any(endpoint, options).await?,
            TlsPolicy::Plain | TlsPolicy::Tls { .. } => {
                let tls = OwnedTLSConfig {
                    identity: None,
                    cert_chain: endpoint.ca_chain.clone(),
                };

                Connection::connect_with_config(&endpoint.uri(), options, tls)
                    .await
                    .map_err(|err| {
                        debug!(error = err.to_string(), "failure to connect");
                        AmqpError::ConnectionError(err.to_string())
                    })?
            }
        };

        conn.on_error(move |err| {
            debug!(error = err.to_string(), "amqp connection closed");
            notifier.notify();
        });

        Ok(Arc::new(LapinConnection { conn }))
    }
}

impl LapinBrokerClient {
    async fn connect_trusting_any(
        endpoint: &BrokerEndpoint,
        options: ConnectionProperties,
    ) -> Result<Connection, AmqpError> {
        let connector = trust_all_connector()?;

        let mut uri: AMQPUri = endpoint.uri().parse().map_err(AmqpError::ConnectionError)?;
        // The handshake below replaces lapin's own TLS upgrade.
        uri.scheme = AMQPScheme::AMQP;

        let connect = move |uri: &AMQPUri| {
            uri.connect()
                .and_then(|stream| stream.into_rustls(&connector, &uri.authority.host))
        };

        Connection::connector(uri, Box::new(connect), options)
            .await
            .map_err(|err| {
                debug!(error = err.to_string(), "failure to connect");
                AmqpError::ConnectionError(err.to_string())
            })
    }
}

/// rustls connector whose verifier accepts every server certificate. Handshake
/// signatures are still checked so the session keys belong to the presented
/// certificate.
fn trust_all_connector() -> Result<RustlsConnector, AmqpError> {
    let provider = Arc::new(crypto::ring::default_provider());

    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|err| AmqpError::TlsConfigError(err.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
        .with_no_client_auth();

    Ok(RustlsConnector::from(config))
}

#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// A `lapin` connection.
pub struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    fn is_open(&self) -> bool {
        self.conn.status().connected()
    }

    async fn create_channel(
        &self,
        notifier: ClosureNotifier,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let channel = self.conn.create_channel().await.map_err(|err| {
            debug!(error = err.to_string(), "error to create the channel");
            AmqpError::ChannelError(err.to_string())
        })?;

        channel.on_error(move |err| {
            debug!(error = err.to_string(), "amqp channel closed");
            notifier.notify();
        });

        Ok(Arc::new(LapinChannel { channel }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "appender closed")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))
    }
}

/// A `lapin` channel.
pub struct LapinChannel {
    channel: Channel,
}

impl LapinChannel {
    fn basic_properties(properties: &PublishProperties) -> BasicProperties {
        let headers: BTreeMap<ShortString, AMQPValue> = properties
            .headers
            .iter()
            .map(|(key, value)| {
                (
                    ShortString::from(key.clone()),
                    AMQPValue::LongString(LongString::from(value.clone())),
                )
            })
            .collect();

        BasicProperties::default()
            .with_app_id(ShortString::from(properties.app_id.clone()))
            .with_kind(ShortString::from(properties.kind.clone()))
            .with_correlation_id(ShortString::from(properties.correlation_id.clone()))
            .with_content_type(ShortString::from(properties.content_type.clone()))
            .with_message_id(ShortString::from(properties.message_id.clone()))
            .with_timestamp(properties.timestamp)
            .with_headers(FieldTable::from(headers))
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                def.name(),
                def.exchange_kind().into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.is_durable(),
                    auto_delete: def.is_auto_delete(),
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| AmqpError::DeclareExchangeError(err.to_string()))
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                def.name(),
                QueueDeclareOptions {
                    passive: false,
                    durable: def.is_durable(),
                    exclusive: def.is_exclusive(),
                    auto_delete: def.is_auto_delete(),
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::DeclareQueueError(err.to_string()))
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                binding.queue_name(),
                binding.exchange_name(),
                binding.key(),
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                debug!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name().to_owned(),
                    binding.queue_name().to_owned(),
                )
            })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: &PublishProperties,
        payload: &[u8],
    ) -> Result<(), AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                Self::basic_properties(properties),
            )
            .await
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?;

        confirm
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::PublishingError(err.to_string()))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "appender closed")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))
    }
}
