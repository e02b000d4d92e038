//! Validated runtime configuration.

use crate::cli::Cli;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("bundle identifier must not be empty")]
    EmptyBundleId,
    #[error("port must be in 1..=65535")]
    InvalidPort,
    #[error("address {0:?} is not a valid IP address")]
    InvalidAddress(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bundle_id: String,
    pub address: IpAddr,
    pub port: u16,
    pub force_barcode: bool,
    pub media_service_version: String,
    /// Override for the media service executable; defaults to
    /// `pier-media-service` next to the host binary.
    pub media_service_executable: Option<PathBuf>,
    /// Override for the service's control socket path.
    pub control_socket: Option<PathBuf>,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let bundle_id = cli.bundle_id.trim().to_string();
        if bundle_id.is_empty() {
            return Err(ConfigError::EmptyBundleId);
        }
        if cli.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        let address: IpAddr = cli
            .address
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(cli.address.clone()))?;

        Ok(Self {
            bundle_id,
            address,
            port: cli.port,
            force_barcode: cli.force_barcode,
            media_service_version: cli.service_version.clone(),
            media_service_executable: cli.media_service.clone(),
            control_socket: cli.control_socket.clone(),
        })
    }

    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use clap::Parser;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["pier"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).expect("cli parses")
    }

    #[test]
    fn accepts_a_minimal_valid_configuration() {
        let config = Config::from_cli(&cli(&["--bundle-id", "com.example.app"])).unwrap();
        assert_eq!(config.bundle_id, "com.example.app");
        assert_eq!(config.port, 55000);
        assert!(!config.force_barcode);
        assert_eq!(config.media_service_version, "6.0.0");
    }

    #[test]
    fn rejects_whitespace_bundle_id() {
        let err = Config::from_cli(&cli(&["--bundle-id", "   "])).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyBundleId));
    }

    #[test]
    fn rejects_port_zero() {
        let err =
            Config::from_cli(&cli(&["--bundle-id", "com.example.app", "--port", "0"]))
                .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort));
    }

    #[test]
    fn rejects_a_hostname_as_address() {
        let err = Config::from_cli(&cli(&[
            "--bundle-id",
            "com.example.app",
            "--address",
            "not-an-ip",
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAddress(_)));
    }

    #[test]
    fn trims_the_bundle_id() {
        let config =
            Config::from_cli(&cli(&["--bundle-id", "  com.example.app  "])).unwrap();
        assert_eq!(config.bundle_id, "com.example.app");
    }
}
