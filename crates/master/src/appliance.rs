//! Appliance handles bound to workers

use crate::config::ApplianceConfig;
use async_trait::async_trait;
use parallelizer_common::{Error, Result};
use serde_json::{json, Value};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

/// A system under test, owned by exactly one worker
#[async_trait]
pub trait Appliance: Send + Sync {
    /// Base url, used for logging and node shutdown notifications
    fn url(&self) -> &str;

    /// Human readable description
    fn describe(&self) -> String {
        self.url().to_string()
    }

    /// JSON descriptor handed to the worker on its command line
    fn descriptor(&self) -> Value {
        json!({ "url": self.url() })
    }

    /// Remove every provider configured on the appliance
    async fn delete_all_providers(&self) -> Result<()>;
}

/// Shared appliance handle
pub type ApplianceRef = Arc<dyn Appliance>;

/// Appliance described in the session configuration
#[derive(Debug, Clone)]
pub struct ConfiguredAppliance {
    config: ApplianceConfig,
}

impl ConfiguredAppliance {
    pub fn new(config: ApplianceConfig) -> Self {
        Self { config }
    }

    pub fn hostname(&self) -> Option<&str> {
        self.config.hostname.as_deref()
    }

    fn cleanup_argv(&self) -> Option<Vec<String>> {
        self.config.cleanup_command.as_ref().map(|argv| {
            argv.iter()
                .map(|arg| arg.replace("{url}", &self.config.url))
                .collect()
        })
    }
}

#[async_trait]
impl Appliance for ConfiguredAppliance {
    fn url(&self) -> &str {
        &self.config.url
    }

    fn describe(&self) -> String {
        match self.hostname() {
            Some(host) => format!("{} ({})", self.config.url, host),
            None => self.config.url.clone(),
        }
    }

    fn descriptor(&self) -> Value {
        json!({
            "url": self.config.url,
            "hostname": self.config.hostname,
        })
    }

    async fn delete_all_providers(&self) -> Result<()> {
        let Some(argv) = self.cleanup_argv() else {
            info!("No cleanup command for {}, keeping providers", self.describe());
            return Ok(());
        };
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::InvalidConfig("empty cleanup_command".to_string()))?;

        debug!("Provider cleanup: {}", argv.join(" "));
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::Runner(format!("cleanup command failed: {}", e)))?;

        if !output.status.success() {
            return Err(Error::Runner(format!(
                "cleanup command exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Build appliance handles from configuration
pub fn from_config(configs: &[ApplianceConfig]) -> Vec<ApplianceRef> {
    configs
        .iter()
        .cloned()
        .map(|c| Arc::new(ConfiguredAppliance::new(c)) as ApplianceRef)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_and_describe() {
        let appliance = ConfiguredAppliance::new(ApplianceConfig {
            url: "https://10.0.0.1".to_string(),
            hostname: Some("10.0.0.1".to_string()),
            cleanup_command: None,
        });
        assert_eq!(appliance.describe(), "https://10.0.0.1 (10.0.0.1)");
        assert_eq!(appliance.descriptor()["hostname"], "10.0.0.1");
    }

    #[tokio::test]
    async fn test_cleanup_without_command_is_noop() {
        let appliance = ConfiguredAppliance::new(ApplianceConfig::from_url("https://a"));
        assert!(appliance.delete_all_providers().await.is_ok());
    }

    #[tokio::test]
    async fn test_cleanup_command_substitutes_url() {
        let appliance = ConfiguredAppliance::new(ApplianceConfig {
            url: "https://a".to_string(),
            hostname: None,
            cleanup_command: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                "test \"$0\" = https://a".to_string(),
                "{url}".to_string(),
            ]),
        });
        assert!(appliance.delete_all_providers().await.is_ok());
    }

    #[tokio::test]
    async fn test_failing_cleanup_command_is_an_error() {
        let appliance = ConfiguredAppliance::new(ApplianceConfig {
            url: "https://a".to_string(),
            hostname: None,
            cleanup_command: Some(vec!["false".to_string()]),
        });
        assert!(appliance.delete_all_providers().await.is_err());
    }

    #[tokio::test]
    async fn test_cleanup_does_not_block_the_runtime() {
        let appliance = ConfiguredAppliance::new(ApplianceConfig {
            url: "https://a".to_string(),
            hostname: None,
            cleanup_command: Some(vec!["sleep".to_string(), "0.3".to_string()]),
        });
        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = ticks.clone();
        let ticker = tokio::spawn(async move {
            loop {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        });

        assert!(appliance.delete_all_providers().await.is_ok());
        ticker.abort();
        // The single-threaded test runtime kept running other tasks
        assert!(ticks.load(std::sync::atomic::Ordering::SeqCst) > 5);
    }
}
