use crate::error::{MigrateError, Result};

/// Page size of the count request used only to read the stage total
pub const COUNT_PAGE_SIZE: u32 = 1;

/// Entities requested per data page
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Exchange the ingestion workers consume from
pub const DEFAULT_PUSH_EXCHANGE: &str = "amqp.worker.exchange";

pub const ROUTING_KEY_PREFIX: &str = "push_routing_";

pub const DEFAULT_BROKER_PORT: u16 = 5672;

pub const DEFAULT_STATE_FILE: &str = "state.json";

/// AMQP delivery mode marking a message persistent
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

pub const BUNDLE_TYPE: &str = "bundle";
pub const SIMPLE_OBSERVABLE_TYPE: &str = "x-opencti-simple-observable";

/// Everything the pipeline needs to reach the source platform and the broker.
///
/// Built from the command line (or environment) and checked with
/// [`MigrateConfig::validate`] before any stage runs.
#[derive(Debug, Clone)]
pub struct MigrateConfig {
    pub source_url: Option<String>,
    pub source_token: Option<String>,
    pub connector_id: Option<String>,
    pub broker_host: Option<String>,
    pub broker_port: u16,
    pub broker_user: Option<String>,
    pub broker_password: Option<String>,
    pub exchange: String,
    pub state_file: String,
    pub page_size: u32,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            source_url: None,
            source_token: None,
            connector_id: None,
            broker_host: None,
            broker_port: DEFAULT_BROKER_PORT,
            broker_user: None,
            broker_password: None,
            exchange: DEFAULT_PUSH_EXCHANGE.to_string(),
            state_file: DEFAULT_STATE_FILE.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// A [`MigrateConfig`] with every mandatory option present.
#[derive(Debug, Clone)]
pub struct ValidConfig {
    pub source_url: String,
    pub source_token: String,
    pub connector_id: String,
    pub broker_host: String,
    pub broker_port: u16,
    pub broker_user: String,
    pub broker_password: String,
    pub exchange: String,
    pub state_file: String,
    pub page_size: u32,
}

impl MigrateConfig {
    /// Reports all missing mandatory options in a single error.
    pub fn validate(self) -> Result<ValidConfig> {
        let mandatory = [
            ("source_url", &self.source_url),
            ("source_token", &self.source_token),
            ("connector_id", &self.connector_id),
            ("broker_host", &self.broker_host),
            ("broker_user", &self.broker_user),
            ("broker_password", &self.broker_password),
        ];
        let missing: Vec<&str> = mandatory
            .iter()
            .filter(|(_, value)| value.as_deref().is_none_or(|v| v.trim().is_empty()))
            .map(|(name, _)| *name)
            .collect();

        if !missing.is_empty() {
            return Err(MigrateError::Configuration(format!(
                "missing mandatory option(s): {}",
                missing.join(", ")
            )));
        }
        if self.page_size == 0 {
            return Err(MigrateError::Configuration(
                "page_size must be greater than zero".to_string(),
            ));
        }

        // Presence checked above.
        let take = |value: Option<String>| value.unwrap_or_default();
        Ok(ValidConfig {
            source_url: take(self.source_url),
            source_token: take(self.source_token),
            connector_id: take(self.connector_id),
            broker_host: take(self.broker_host),
            broker_port: self.broker_port,
            broker_user: take(self.broker_user),
            broker_password: take(self.broker_password),
            exchange: self.exchange,
            state_file: self.state_file,
            page_size: self.page_size,
        })
    }
}

impl ValidConfig {
    pub fn routing_key(&self) -> String {
        routing_key(&self.connector_id)
    }
}

pub fn routing_key(connector_id: &str) -> String {
    format!("{ROUTING_KEY_PREFIX}{connector_id}")
}
