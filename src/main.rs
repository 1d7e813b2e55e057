use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use oxbow::config::Config;
use oxbow::irc::server::{accept_loop, Listener, Server};
use oxbow::supervisor::Supervisor;

#[derive(Parser)]
#[command(name = "oxbow", about = "minimalist irc server", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the IRC server
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Config filename
    #[arg(long)]
    config: Option<PathBuf>,
    /// Hostname of the IRC server
    #[arg(long)]
    hostname: Option<String>,
    /// Address to bind to
    #[arg(long)]
    bind: Option<String>,
    /// Path to the MOTD file
    #[arg(long)]
    motd: Option<String>,
    /// Path to the SSL key file
    #[arg(long = "sslKey")]
    ssl_key: Option<String>,
    /// Path to the SSL cert file
    #[arg(long = "sslCert")]
    ssl_cert: Option<String>,
    /// Path to the SSL CA file
    #[arg(long = "sslCA")]
    ssl_ca: Option<String>,
    /// Log pretty messages in the console
    #[arg(long = "prettyConsole")]
    pretty_console: bool,
}

impl RunArgs {
    /// CLI flags override file values.
    fn merge_into(self, config: &mut Config) {
        if let Some(hostname) = self.hostname {
            config.hostname = hostname;
        }
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(motd) = self.motd {
            config.motd = motd;
        }
        if let Some(ssl_key) = self.ssl_key {
            config.ssl_key = ssl_key;
        }
        if let Some(ssl_cert) = self.ssl_cert {
            config.ssl_cert = ssl_cert;
        }
        if let Some(ssl_ca) = self.ssl_ca {
            config.ssl_ca = ssl_ca;
        }
        if self.pretty_console {
            config.pretty_console = true;
        }
    }
}

fn init_tracing(pretty: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if pretty {
        builder.pretty().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    args.merge_into(&mut config);

    init_tracing(config.pretty_console);
    info!("oxbow starting");

    let mut supervisor = Supervisor::new();

    let listener = Listener::bind(&config).await?;
    let hostname = config.resolved_hostname();

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let mut server = Server::new(config, events_rx, supervisor.shutdown_handle());
    server.setup_bridges().await?;

    supervisor.spawn(
        "listener",
        accept_loop(listener, hostname, events_tx, supervisor.shutdown_handle()),
    );
    supervisor.spawn("router", server.run());
    supervisor.spawn_signal_handler();

    supervisor.join().await
}
