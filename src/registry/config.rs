//! Registry configuration

use std::time::Duration;

/// Configuration for the stream registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a new stream may stay unsubscribed before it is removed
    pub orphan_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            orphan_timeout: Duration::from_secs(60),
        }
    }
}

impl RegistryConfig {
    /// Set the orphan timeout
    pub fn orphan_timeout(mut self, timeout: Duration) -> Self {
        self.orphan_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_orphan_timeout() {
        assert_eq!(RegistryConfig::default().orphan_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_builder() {
        let config = RegistryConfig::default().orphan_timeout(Duration::from_millis(50));
        assert_eq!(config.orphan_timeout, Duration::from_millis(50));
    }
}
