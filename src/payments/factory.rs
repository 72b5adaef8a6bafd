use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::gateway::GatewayAdapter;
use crate::payments::providers::CpuGateway;
use crate::payments::types::GatewayName;
use crate::payments::utils::parse_code_mappings;
use std::collections::HashMap;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct GatewayFactoryConfig {
    pub default_gateway: GatewayName,
    pub enabled_gateways: Vec<GatewayName>,
    /// ILS driver → gateway, for installations that route different library
    /// sources to different providers
    pub driver_overrides: HashMap<String, GatewayName>,
}

impl GatewayFactoryConfig {
    pub fn from_env() -> PaymentResult<Self> {
        let default_gateway =
            std::env::var("DEFAULT_PAYMENT_GATEWAY").unwrap_or_else(|_| "cpu".to_string());
        let default_gateway = GatewayName::from_str(&default_gateway)?;

        let enabled_raw =
            std::env::var("ENABLED_PAYMENT_GATEWAYS").unwrap_or_else(|_| "cpu".to_string());
        let mut enabled_gateways = Vec::new();
        for part in enabled_raw.split(',') {
            let value = part.trim();
            if value.is_empty() {
                continue;
            }
            enabled_gateways.push(GatewayName::from_str(value)?);
        }

        if !enabled_gateways.contains(&default_gateway) {
            return Err(PaymentError::ValidationError {
                message: "default gateway must be enabled".to_string(),
                field: Some("DEFAULT_PAYMENT_GATEWAY".to_string()),
            });
        }

        let mut driver_overrides = HashMap::new();
        if let Ok(raw) = std::env::var("GATEWAY_DRIVER_OVERRIDES") {
            for (driver, gateway) in parse_code_mappings(&raw) {
                driver_overrides.insert(driver, GatewayName::from_str(&gateway)?);
            }
        }

        Ok(Self {
            default_gateway,
            enabled_gateways,
            driver_overrides,
        })
    }
}

pub struct GatewayFactory {
    config: GatewayFactoryConfig,
}

impl GatewayFactory {
    pub fn from_env() -> PaymentResult<Self> {
        let config = GatewayFactoryConfig::from_env()?;
        Ok(Self { config })
    }

    pub fn with_config(config: GatewayFactoryConfig) -> Self {
        Self { config }
    }

    pub fn get_gateway(&self, gateway: GatewayName) -> PaymentResult<Box<dyn GatewayAdapter>> {
        if !self.config.enabled_gateways.contains(&gateway) {
            return Err(PaymentError::ValidationError {
                message: format!("gateway {} is disabled", gateway),
                field: Some("gateway".to_string()),
            });
        }

        match gateway {
            GatewayName::Cpu => Ok(Box::new(CpuGateway::from_env()?)),
        }
    }

    pub fn get_default_gateway(&self) -> PaymentResult<Box<dyn GatewayAdapter>> {
        self.get_gateway(self.config.default_gateway)
    }

    pub fn default_gateway(&self) -> GatewayName {
        self.config.default_gateway
    }

    pub fn driver_overrides(&self) -> &HashMap<String, GatewayName> {
        &self.config.driver_overrides
    }

    /// Resolve the gateway for an ILS driver, honoring per-driver overrides.
    pub fn gateway_for_driver(&self, driver: &str) -> GatewayName {
        self.config
            .driver_overrides
            .get(driver)
            .copied()
            .unwrap_or(self.config.default_gateway)
    }

    pub fn list_enabled_gateways(&self) -> Vec<GatewayName> {
        self.config.enabled_gateways.clone()
    }
}
