//! Configuration types for the pulsar-flex client

use crate::error::PulsarFlexError;
use crate::protocol::AccessMode;
use std::time::Duration;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker addresses tried in order when dialing
    pub discovery_servers: Vec<String>,
    /// JWT presented with the `token` auth method
    pub jwt: Option<String>,
    /// Connection timeout
    pub connection_timeout: Duration,
    /// Upper bound for every correlated response await
    pub operation_timeout: Duration,
    /// Client version announced in the Connect command
    pub client_version: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            discovery_servers: vec!["localhost:6650".to_string()],
            jwt: None,
            connection_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(30),
            client_version: format!("pulsar-flex-rust-{}", crate::VERSION),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), PulsarFlexError> {
        if self.discovery_servers.is_empty() {
            return Err(PulsarFlexError::invalid_config(
                "At least one discovery server must be specified",
            ));
        }
        if self.operation_timeout.is_zero() {
            return Err(PulsarFlexError::invalid_config(
                "Operation timeout must be positive",
            ));
        }
        Ok(())
    }
}

/// Producer-specific configuration
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Base client configuration
    pub client_config: ClientConfig,
    /// Topic the producer publishes to
    pub topic: String,
    /// Access mode requested at registration
    pub access_mode: AccessMode,
    /// Requested producer name; the broker assigns one when absent
    pub producer_name: Option<String>,
    /// Retry policy for sends that fail transiently
    pub send_retry: RetryConfig,
    /// Retry policy for re-registration after a lost connection
    pub reconnect_retry: RetryConfig,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            client_config: ClientConfig::default(),
            topic: String::new(),
            access_mode: AccessMode::Shared,
            producer_name: None,
            send_retry: RetryConfig::default(),
            reconnect_retry: RetryConfig {
                max_retries: 5,
                ..RetryConfig::default()
            },
        }
    }
}

impl ProducerConfig {
    pub fn validate(&self) -> Result<(), PulsarFlexError> {
        if self.topic.is_empty() {
            return Err(PulsarFlexError::invalid_config("Topic must be specified"));
        }
        self.client_config.validate()
    }
}

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries
    pub max_retries: usize,
    /// Initial retry delay
    pub initial_delay: Duration,
    /// Maximum retry delay
    pub max_delay: Duration,
    /// Retry delay multiplier
    pub multiplier: f64,
    /// Jitter for retry delays
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// A policy that never retries
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-indexed):
    /// `min(initial_delay * multiplier^attempt, max_delay)`, scaled by
    /// 0.75..1.25 when jitter is enabled.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let base = Duration::from_millis(base_ms as u64).min(self.max_delay);

        if self.jitter {
            let factor = 0.75 + rand::random::<f64>() * 0.5;
            Duration::from_millis((base.as_millis() as f64 * factor) as u64)
        } else {
            base
        }
    }
}

/// Builder for ClientConfig
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn discovery_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.discovery_servers = servers.into_iter().map(|s| s.into()).collect();
        self
    }

    pub fn jwt<S: Into<String>>(mut self, jwt: S) -> Self {
        self.config.jwt = Some(jwt.into());
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.config.operation_timeout = timeout;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Builder for ProducerConfig
#[derive(Debug, Default)]
pub struct ProducerConfigBuilder {
    config: ProducerConfig,
}

impl ProducerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_config(mut self, client_config: ClientConfig) -> Self {
        self.config.client_config = client_config;
        self
    }

    pub fn discovery_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.client_config.discovery_servers =
            servers.into_iter().map(|s| s.into()).collect();
        self
    }

    pub fn jwt<S: Into<String>>(mut self, jwt: S) -> Self {
        self.config.client_config.jwt = Some(jwt.into());
        self
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.config.client_config.operation_timeout = timeout;
        self
    }

    pub fn topic<S: Into<String>>(mut self, topic: S) -> Self {
        self.config.topic = topic.into();
        self
    }

    pub fn access_mode(mut self, access_mode: AccessMode) -> Self {
        self.config.access_mode = access_mode;
        self
    }

    pub fn producer_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.producer_name = Some(name.into());
        self
    }

    pub fn send_retry(mut self, retry: RetryConfig) -> Self {
        self.config.send_retry = retry;
        self
    }

    pub fn reconnect_retry(mut self, retry: RetryConfig) -> Self {
        self.config.reconnect_retry = retry;
        self
    }

    pub fn build(self) -> ProducerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_builder() {
        let config = ClientConfigBuilder::new()
            .discovery_servers(vec!["broker1:6650", "broker2:6650"])
            .connection_timeout(Duration::from_secs(3))
            .jwt("token-abc")
            .build();

        assert_eq!(config.discovery_servers, vec!["broker1:6650", "broker2:6650"]);
        assert_eq!(config.connection_timeout, Duration::from_secs(3));
        assert_eq!(config.jwt, Some("token-abc".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_producer_config_builder() {
        let config = ProducerConfigBuilder::new()
            .discovery_servers(vec!["localhost:6650"])
            .topic("persistent://public/default/t1")
            .access_mode(AccessMode::Exclusive)
            .build();

        assert_eq!(config.topic, "persistent://public/default/t1");
        assert_eq!(config.access_mode, AccessMode::Exclusive);
        assert_eq!(config.producer_name, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_missing_topic_and_servers() {
        let config = ProducerConfig::default();
        assert!(matches!(
            config.validate(),
            Err(PulsarFlexError::InvalidConfig { .. })
        ));

        let config = ProducerConfigBuilder::new()
            .topic("t1")
            .discovery_servers(Vec::<String>::new())
            .build();
        assert!(matches!(
            config.validate(),
            Err(PulsarFlexError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_backoff_without_jitter() {
        let retry = RetryConfig {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: false,
        };

        assert_eq!(retry.backoff(0), Duration::from_millis(100));
        assert_eq!(retry.backoff(1), Duration::from_millis(200));
        assert_eq!(retry.backoff(2), Duration::from_millis(400));
        assert_eq!(retry.backoff(3), Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let retry = RetryConfig {
            initial_delay: Duration::from_millis(1000),
            jitter: true,
            ..RetryConfig::default()
        };

        for _ in 0..50 {
            let delay = retry.backoff(0);
            assert!(delay >= Duration::from_millis(750));
            assert!(delay <= Duration::from_millis(1250));
        }
    }
}
