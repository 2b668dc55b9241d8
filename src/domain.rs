//! Core entities: application keys, their configuration, and the plugin
//! metadata surfaced by the management endpoints.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

pub const MAX_KEY_NAME_CODEPOINTS: usize = 50;

pub type KeyId = i64;

/// A single scalar in a plugin configuration map. Config bags are typed at
/// the edge instead of carrying loose JSON values through the pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Number(f64),
    String(String),
}

impl ConfigValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::String(value) => value.parse().ok(),
            Self::Bool(_) => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        let value = self.as_f64()?;
        if value.is_finite() && value >= 0.0 {
            Some(value as u64)
        } else {
            None
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<f64> for ConfigValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

pub type ConfigMap = BTreeMap<String, ConfigValue>;

/// A (plugin id, config) pair naming either the provider selection or one
/// middleware entry of a key.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: ConfigMap,
}

impl PluginConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            config: BTreeMap::new(),
        }
    }
}

/// Operational settings owned by a [`Key`]. Middleware order is significant:
/// the first entry is the outermost wrapper around the execution handler.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyConfiguration {
    pub provider: PluginConfig,
    #[serde(default)]
    pub middlewares: Vec<PluginConfig>,
    /// Monetary budget ceiling in dollars; 0 disables enforcement.
    #[serde(default)]
    pub budget_limit: f64,
    /// Budget reset period in seconds; 0 means never.
    #[serde(default)]
    pub reset_period_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Key {
    pub id: KeyId,
    pub name: String,
    pub key_hash: String,
    pub prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<SystemTime>,
    #[serde(default)]
    pub auto_renew: bool,
    pub budget_usage: f64,
    pub last_reset_at: SystemTime,
    pub created_at: SystemTime,
    pub configuration: KeyConfiguration,
}

impl Key {
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => SystemTime::now() > expires_at,
            None => false,
        }
    }

    /// True when the configured reset period has elapsed since the last reset.
    pub fn reset_due(&self) -> bool {
        if self.configuration.reset_period_secs == 0 {
            return false;
        }
        let period = Duration::from_secs(self.configuration.reset_period_secs);
        SystemTime::now() > self.last_reset_at + period
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(GatewayError::Validation("key name is required".to_string()));
        }
        if self.name.chars().count() > MAX_KEY_NAME_CODEPOINTS {
            return Err(GatewayError::Validation(format!(
                "key name is too long (max {MAX_KEY_NAME_CODEPOINTS} characters)"
            )));
        }
        let allowed = |c: char| c.is_alphanumeric() || c == '_' || c == '-' || c.is_whitespace();
        if !self.name.chars().all(allowed) {
            return Err(GatewayError::Validation(
                "key name contains invalid characters".to_string(),
            ));
        }
        if self.configuration.provider.id.is_empty() {
            return Err(GatewayError::Validation("provider is required".to_string()));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Select,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldRole {
    Limit,
    Period,
}

/// Describes one configuration field of a provider or middleware. Served by
/// the `List*` endpoints so clients can render config forms.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FieldSchema {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub field_type: Option<FieldType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ConfigValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<FieldRole>,
}

impl FieldSchema {
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type: Some(field_type),
            ..Self::default()
        }
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn default_value(mut self, value: impl Into<ConfigValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    pub fn role(mut self, role: FieldRole) -> Self {
        self.role = Some(role);
        self
    }
}

pub type PluginSchema = BTreeMap<String, FieldSchema>;

/// Metadata about a registered provider or middleware.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PluginInfo {
    pub id: String,
    #[serde(default)]
    pub schema: PluginSchema,
}
