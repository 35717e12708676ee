// Copyright (C) 2025, 2026 Sv2 Template Provider Developers (see AUTHORS)
//
// This file is part of sv2-template-provider
//
// sv2-template-provider is free software: you can redistribute it and/or
// modify it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// sv2-template-provider is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General
// Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with sv2-template-provider. If not, see <https://www.gnu.org/licenses/>.

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Sv2TemplateProviderConfig {
    /// The bind address for the listener
    pub host: String,
    /// The bind port for the listener
    pub port: u16,
    /// Minimum seconds between fee-bump templates pushed to a client
    #[serde(default = "default_fee_check_interval")]
    pub fee_check_interval: u64,
    /// Minimum fee rise in satoshis that justifies a new template when the
    /// tip has not changed
    #[serde(default = "default_fee_delta")]
    pub fee_delta: u64,
    /// Test pacing: bounded waits and a short yield between iterations
    #[serde(default)]
    pub is_test: bool,
    /// The network can be "main", "test", "testnet4", "signet" or "regtest"
    #[serde(deserialize_with = "deserialize_network")]
    pub network: bitcoin::Network,
    /// Logging options for the embedding process
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log to file if specified
    pub file: Option<String>,
    /// Log level (defaults to "info")
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: None,
            level: default_log_level(),
        }
    }
}

fn default_fee_check_interval() -> u64 {
    30
}

fn default_fee_delta() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// helper function to deserialize the network from the config file, which is
/// provided as a string like Core
fn deserialize_network<'de, D>(deserializer: D) -> Result<bitcoin::Network, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    bitcoin::Network::from_core_arg(&s).map_err(serde::de::Error::custom)
}

impl Default for Sv2TemplateProviderConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8336,
            fee_check_interval: default_fee_check_interval(),
            fee_delta: default_fee_delta(),
            is_test: false,
            network: bitcoin::Network::Bitcoin,
            logging: LoggingConfig::default(),
        }
    }
}

impl Sv2TemplateProviderConfig {
    pub fn load(path: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("SV2TP").separator("_"))
            .build()?
            .try_deserialize()
    }
}
