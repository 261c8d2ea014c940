use anyhow::Result;
use clap::Parser;
use deviceplugin::config::Cli;
use deviceplugin::config::Commands;
use deviceplugin::config::DaemonArgs;
use utils::logging;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(daemon_args) => run_daemon(*daemon_args).await,
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = logging::init(std::env::var_os(logging::LOG_PATH_ENV_VAR));

    tracing::info!("Starting device plugin {}", &**version::VERSION);
    tracing::debug!(?daemon_args, "Configuration");

    deviceplugin::app::run(daemon_args)
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))
}
