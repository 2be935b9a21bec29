//! YAML configuration of the gateway binary.
use indexmap::IndexMap;
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::{fs, io, path::Path};
use tracing::debug;

use crate::error::GatewayError;
use crate::schema_registry::ServiceDefinition;

#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    pub services: IndexMap<String, ServiceConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ServiceConfig {
    pub routing_url: String,
    pub schema: SchemaConfig,
    #[serde(default)]
    pub underlying_schema: Option<SchemaConfig>,
}

#[derive(Debug, Deserialize)]
pub struct SchemaConfig {
    pub file: String,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 3000))
}

fn default_log_filter() -> String {
    "info".to_string()
}

/// A service read from the configuration, schema files already loaded.
#[derive(Debug)]
pub struct ConfiguredService {
    pub definition: ServiceDefinition,
    pub routing_url: String,
}

impl GatewayConfig {
    pub fn from_yaml(contents: &str) -> Result<Self, GatewayError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn load(path: &Path) -> Result<Self, GatewayError> {
        debug!(?path, "reading gateway configuration");
        let contents = fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        GatewayConfig::from_yaml(&contents)
    }

    /// Loads every service's schema files, resolved relative to `base_dir`.
    pub fn service_definitions(
        &self,
        base_dir: &Path,
    ) -> Result<Vec<ConfiguredService>, GatewayError> {
        self.services
            .iter()
            .map(|(name, service)| -> Result<ConfiguredService, GatewayError> {
                let mut definition =
                    ServiceDefinition::new(name, read_schema_file(base_dir, &service.schema.file)?);
                if let Some(underlying) = &service.underlying_schema {
                    definition = definition
                        .with_underlying_schema(read_schema_file(base_dir, &underlying.file)?);
                }
                Ok(ConfiguredService {
                    definition,
                    routing_url: service.routing_url.clone(),
                })
            })
            .collect()
    }
}

fn read_schema_file(base_dir: &Path, file_path: &str) -> io::Result<String> {
    let full_path = base_dir.join(file_path);
    debug!(path = ?full_path, "reading schema file");
    fs::read_to_string(full_path)
}
