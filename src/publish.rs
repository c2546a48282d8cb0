use crate::config::PERSISTENT_DELIVERY_MODE;
use crate::error::{MigrateError, Result};
use crate::models::{Bundle, PublishMessage};
use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::{debug, info, warn};

/// Narrow view of the message broker used by the [`Publisher`].
#[async_trait(?Send)]
pub trait Broker {
    /// Publish `payload` persistently to `exchange` under `routing_key`.
    async fn publish(&mut self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()>;

    /// Tear down and recreate the connection and channel.
    async fn reconnect(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered,
    DeliveredAfterRetry,
}

/// Sends bundles to the ingestion workers, reconnecting and retrying once.
///
/// A failure of the retry is returned as [`MigrateError::DeliveryFailed`];
/// nothing is dropped silently.
pub struct Publisher<B> {
    broker: B,
    exchange: String,
    routing_key: String,
}

impl<B: Broker> Publisher<B> {
    pub fn new(broker: B, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            broker,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }

    pub async fn publish(&mut self, bundle: &Bundle) -> Result<PublishOutcome> {
        let payload = PublishMessage::from_bundle(bundle)?.to_bytes()?;

        let first = match self
            .broker
            .publish(&self.exchange, &self.routing_key, &payload)
            .await
        {
            Ok(()) => return Ok(PublishOutcome::Delivered),
            Err(e) => e,
        };

        warn!(error = %first, "Publish failed, reconnecting to broker");
        if let Err(e) = self.broker.reconnect().await {
            return Err(MigrateError::DeliveryFailed(format!(
                "{first}; reconnect failed: {e}"
            )));
        }

        match self
            .broker
            .publish(&self.exchange, &self.routing_key, &payload)
            .await
        {
            Ok(()) => {
                info!("Publish succeeded after reconnect");
                Ok(PublishOutcome::DeliveredAfterRetry)
            }
            Err(e) => Err(MigrateError::DeliveryFailed(format!(
                "{first}; retry failed: {e}"
            ))),
        }
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn into_broker(self) -> B {
        self.broker
    }
}

/// Broker credentials and address.
#[derive(Debug, Clone)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl BrokerEndpoint {
    fn uri(&self) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.user.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            ..AMQPUri::default()
        }
    }
}

/// AMQP 0-9-1 broker with publisher confirms on a single channel.
pub struct AmqpBroker {
    endpoint: BrokerEndpoint,
    exchange: String,
    connection: Connection,
    channel: Channel,
}

impl AmqpBroker {
    pub async fn connect(endpoint: BrokerEndpoint, exchange: &str) -> Result<Self> {
        let (connection, channel) = open(&endpoint, exchange).await?;
        info!(host = %endpoint.host, port = endpoint.port, "Connected to broker");
        Ok(Self {
            endpoint,
            exchange: exchange.to_string(),
            connection,
            channel,
        })
    }

    pub async fn close(self) -> Result<()> {
        self.connection.close(200, "migration finished").await?;
        Ok(())
    }
}

async fn open(endpoint: &BrokerEndpoint, exchange: &str) -> Result<(Connection, Channel)> {
    let connection = Connection::connect_uri(endpoint.uri(), ConnectionProperties::default())
        .await
        .map_err(|e| {
            MigrateError::Connection(format!(
                "cannot reach broker at {}:{}: {e}",
                endpoint.host, endpoint.port
            ))
        })?;
    let channel = connection.create_channel().await?;
    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await?;
    channel
        .exchange_declare(
            exchange,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await?;
    Ok((connection, channel))
}

#[async_trait(?Send)]
impl Broker for AmqpBroker {
    async fn publish(&mut self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_delivery_mode(PERSISTENT_DELIVERY_MODE),
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(MigrateError::Connection(
                "broker did not acknowledge message".to_string(),
            ));
        }
        debug!(routing_key, bytes = payload.len(), "Published bundle");
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<()> {
        if let Err(e) = self.connection.close(320, "reconnecting").await {
            debug!(error = %e, "Closing stale connection failed");
        }
        let (connection, channel) = open(&self.endpoint, &self.exchange).await?;
        self.connection = connection;
        self.channel = channel;
        info!("Reconnected to broker");
        Ok(())
    }
}
