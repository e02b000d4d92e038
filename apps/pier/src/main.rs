use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use pier::advertise::MdnsAdvertiser;
use pier::cli::Cli;
use pier::config::Config;
use pier::coordinator::{Coordinator, MediaStack, MediaStackFactory};
use pier::identity::ServerIdStore;
use pier::logsink::{LogSink, MemoryLogSink};
use pier::presenter::TracingPresenter;
use pier::rpc::{MediaServiceRpc, PipeRpcClient};
use pier::supervisor::{ProcessSupervisor, SupervisorConfig};
use pier::telemetry;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const MEDIA_SERVICE_EXECUTABLE: &str = "pier-media-service";
const CONTROL_SOCKET_FILE: &str = "media-control.sock";

/// Production media stack: supervised child process plus a pipe client
/// to its control socket. A missing executable downgrades to RPC-only
/// operation instead of refusing to serve.
struct ProcessMediaStackFactory {
    executable: PathBuf,
    control_socket: PathBuf,
}

#[async_trait]
impl MediaStackFactory for ProcessMediaStackFactory {
    async fn build(&self, sink: Arc<dyn LogSink>) -> anyhow::Result<MediaStack> {
        let supervisor = match ProcessSupervisor::launch(
            SupervisorConfig::for_executable(self.executable.clone()),
            Arc::clone(&sink),
        )
        .await
        {
            Ok(supervisor) => Some(supervisor),
            Err(err) => {
                warn!(error = %err, "media service not supervised");
                sink.append(&format!("media service not supervised: {err}"));
                None
            }
        };

        let rpc: Arc<dyn MediaServiceRpc> =
            Arc::new(PipeRpcClient::new(self.control_socket.clone()));
        Ok(MediaStack { supervisor, rpc })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init(&cli.logging.to_config()).context("logging init")?;

    let config = match Config::from_cli(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            std::process::exit(2);
        }
    };

    let server_id = ServerIdStore::open_default()
        .context("locate identity store")?
        .load_or_create()
        .context("load server identity")?;
    info!(server_id = %server_id, "host identity loaded");

    let install_dir = std::env::current_exe()
        .ok()
        .and_then(|path| path.parent().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));
    let executable = config
        .media_service_executable
        .clone()
        .unwrap_or_else(|| install_dir.join(MEDIA_SERVICE_EXECUTABLE));
    let control_socket = config
        .control_socket
        .clone()
        .unwrap_or_else(|| install_dir.join(CONTROL_SOCKET_FILE));

    let sink = Arc::new(MemoryLogSink::new());
    let coordinator = Coordinator::new(
        config,
        server_id,
        Arc::new(TracingPresenter),
        sink,
        Arc::new(MdnsAdvertiser::new()),
        Arc::new(ProcessMediaStackFactory {
            executable,
            control_socket,
        }),
    );

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                shutdown.cancel();
            }
        });
    }

    coordinator.run(shutdown).await
}
