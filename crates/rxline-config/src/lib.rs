/*
 * RxLine - Prescription analysis dispatch service
 * Copyright (C) 2025–2026 RxLine Contributors
 *
 * This program is free software: you can redistribute it
 * and/or modify it under the terms of the GNU Affero
 * General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your
 * option) any later version.
 *
 * This program is distributed in the hope that it will be
 * useful, but WITHOUT ANY WARRANTY; without even the
 * implied warranty of MERCHANTABILITY or FITNESS FOR A
 * PARTICULAR PURPOSE. See the GNU Affero General Public
 * License for more details.
 *
 * You should have received a copy of the GNU Affero General
 * Public License along with this program. If not, see
 * <https://www.gnu.org/licenses/>.
 */

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use serde::Deserialize;

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub service: ServiceConfig,
    pub nats: NatsConfig,
    pub provider: ProviderConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ServiceConfig {
    pub env: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct NatsConfig {
    pub url: String,
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_reconnect_wait")]
    pub reconnect_wait_seconds: u64,
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: usize,
}

fn default_subject_prefix() -> String {
    "rxline".to_string()
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_reconnect_wait() -> u64 {
    5
}
fn default_max_reconnects() -> usize {
    10
}

#[derive(Deserialize, Clone, Debug)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_base_url")]
    pub base_url: String,
    pub api_key: String,
    #[serde(default = "default_provider_model")]
    pub model: String,
    #[serde(default = "default_completion_max_tokens")]
    pub completion_max_tokens: u32,
    #[serde(default = "default_analysis_max_tokens")]
    pub analysis_max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_provider_base_url() -> String {
    "https://api.avalai.ir/v1".to_string()
}
fn default_provider_model() -> String {
    "gemini-2.0-flash-thinking-exp-01-21".to_string()
}
fn default_completion_max_tokens() -> u32 {
    2000
}
fn default_analysis_max_tokens() -> u32 {
    8000
}
fn default_temperature() -> f32 {
    0.7
}

/// Timeout budgets for the analysis pipeline. The worst case for one job is
/// the sum of its per-tier budgets (two text tiers for jobs that cross the
/// bus), so the synchronous wait values below must exceed that sum or a
/// slow worker's valid reply is abandoned mid-chain.
#[derive(Deserialize, Clone, Debug)]
pub struct AnalysisConfig {
    #[serde(default = "default_text_timeout")]
    pub text_timeout_seconds: u64,
    #[serde(default = "default_vision_timeout")]
    pub vision_timeout_seconds: u64,
    #[serde(default = "default_download_timeout")]
    pub download_timeout_seconds: u64,
    #[serde(default = "default_completion_wait")]
    pub completion_wait_seconds: u64,
    #[serde(default = "default_prescription_wait")]
    pub prescription_wait_seconds: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            text_timeout_seconds: default_text_timeout(),
            vision_timeout_seconds: default_vision_timeout(),
            download_timeout_seconds: default_download_timeout(),
            completion_wait_seconds: default_completion_wait(),
            prescription_wait_seconds: default_prescription_wait(),
        }
    }
}

fn default_text_timeout() -> u64 {
    30
}
fn default_vision_timeout() -> u64 {
    45
}
fn default_download_timeout() -> u64 {
    20
}
fn default_completion_wait() -> u64 {
    75
}
fn default_prescription_wait() -> u64 {
    90
}

#[derive(Deserialize, Clone, Debug)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_pg_min")]
    pub min_connections: u32,
    #[serde(default = "default_pg_max")]
    pub max_connections: u32,
}

fn default_pg_min() -> u32 {
    2
}
fn default_pg_max() -> u32 {
    10
}

#[derive(Deserialize, Clone, Debug)]
pub struct StorageConfig {
    /// Base URL prepended to object keys when handing images to the
    /// analysis pipeline. Empty means object keys are rejected and only
    /// full URLs are accepted.
    #[serde(default)]
    pub public_base_url: String,
    #[serde(default = "default_url_ttl_hours")]
    pub url_ttl_hours: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            public_base_url: String::new(),
            url_ttl_hours: default_url_ttl_hours(),
        }
    }
}

fn default_url_ttl_hours() -> u64 {
    24
}

#[derive(Deserialize, Clone, Debug)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            cors_origins: Vec::new(),
        }
    }
}

fn default_gateway_port() -> u16 {
    8080
}

#[derive(Deserialize, Clone, Debug)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: default_otlp_endpoint(),
            sample_rate: default_sample_rate(),
        }
    }
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_sample_rate() -> f64 {
    1.0
}

impl Config {
    /// Load configuration from the file named by the `RXLINE_CONFIG` env
    /// var (default `config.toml`), with `RXLINE_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns `config::ConfigError` if the file is missing, malformed, or
    /// required fields are absent.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("RXLINE_CONFIG").unwrap_or_else(|_| "config.toml".to_string());

        let settings = config::Config::builder()
            .add_source(config::File::with_name(&config_path))
            .add_source(
                config::Environment::with_prefix("RXLINE")
                    .separator("_")
                    .try_parsing(true),
            )
            .build()?;

        settings.try_deserialize()
    }
}
