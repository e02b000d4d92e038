use crate::rpc::DEFAULT_SERVICE_VERSION;
use crate::telemetry::{LogConfig, LogLevel};
use clap::{Args, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "pier",
    about = "Host-side endpoint for local-link remote rendering sessions",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "PIER_BUNDLE_ID",
        help = "Application bundle identifier advertised to clients"
    )]
    pub bundle_id: String,

    #[arg(
        long,
        env = "PIER_PORT",
        default_value_t = 55000,
        help = "TCP port for session connections"
    )]
    pub port: u16,

    #[arg(
        long,
        env = "PIER_ADDRESS",
        default_value = "0.0.0.0",
        help = "IP address to bind and advertise"
    )]
    pub address: String,

    #[arg(
        long,
        env = "PIER_FORCE_BARCODE",
        help = "Always require QR pairing by omitting the certificate fingerprint"
    )]
    pub force_barcode: bool,

    #[arg(
        long,
        env = "PIER_SERVICE_VERSION",
        default_value = DEFAULT_SERVICE_VERSION,
        help = "Version string passed to the media service on start"
    )]
    pub service_version: String,

    #[arg(
        long,
        env = "PIER_MEDIA_SERVICE",
        help = "Path to the media service executable (defaults to pier-media-service beside the host binary)"
    )]
    pub media_service: Option<PathBuf>,

    #[arg(
        long,
        env = "PIER_CONTROL_SOCKET",
        help = "Path of the media service control socket"
    )]
    pub control_socket: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "PIER_LOG_LEVEL",
        default_value_t = LogLevel::Info,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "PIER_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}
