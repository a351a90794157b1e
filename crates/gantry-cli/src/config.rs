//! Gateway configuration file

use gantry_client::{DialError, DialOptions, Endpoint};
use gantry_gateway::GatewayConfig;
use prost_reflect::{DescriptorError, DescriptorPool, ServiceDescriptor};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Invalid or unreadable configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid descriptor set {path}: {source}")]
    Descriptors {
        path: PathBuf,
        #[source]
        source: DescriptorError,
    },

    #[error("Service {0} not found in descriptor set")]
    UnknownService(String),

    #[error("Invalid upstream for {service}: {source}")]
    Upstream {
        service: String,
        #[source]
        source: DialError,
    },
}

/// One routed service and the process serving it
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Fully qualified service name
    pub name: String,
    /// `http://host:port` of the RPC server
    pub upstream: String,
    #[serde(default)]
    pub dial: DialOptions,
}

impl ServiceConfig {
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        Endpoint::parse(&self.upstream).map_err(|source| ConfigError::Upstream {
            service: self.name.clone(),
            source,
        })
    }
}

/// Contents of `gateway.yaml`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CliConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Encoded `FileDescriptorSet`; relative to the configuration file
    pub descriptor_set: PathBuf,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

impl CliConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: CliConfig = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if config.descriptor_set.is_relative() {
            if let Some(dir) = path.parent() {
                config.descriptor_set = dir.join(&config.descriptor_set);
            }
        }
        Ok(config)
    }
}

/// Decode a descriptor set file
pub fn load_descriptor_pool(path: &Path) -> Result<DescriptorPool, ConfigError> {
    let bytes = std::fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    DescriptorPool::decode(bytes.as_slice()).map_err(|source| ConfigError::Descriptors {
        path: path.to_path_buf(),
        source,
    })
}

pub fn find_service(pool: &DescriptorPool, name: &str) -> Result<ServiceDescriptor, ConfigError> {
    pool.get_service_by_name(name)
        .ok_or_else(|| ConfigError::UnknownService(name.to_string()))
}
