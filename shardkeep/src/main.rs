use std::process::ExitCode;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use shardkeep::clock::{self, SynchronizedClock};
use shardkeep::id::Snowflake;
use shardkeep::model::{Runner, RunnerAddress};
use shardkeep::runners::{self, Runners};
use shardkeep::shard_manager::{self, ShardManager};
use shardkeep::sharding::{LocalShardManagerClient, RemoteShardManagerClient, ShardManagerClient, Sharding};
use shardkeep::storage::{MemoryMessageStorage, MemoryRunnerStorage, MessageStorage, RunnerStorage, SqlMessageStorage, SqlRunnerStorage};
use shardkeep::{cli, config, logger};
use shardkeep_config::{Backend, ConfigFile};

fn main() -> ExitCode {
    let cli = cli::Cli::parse();

    let loaded = match config::load(&cli.config) {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("failed to load \"{}\": {err}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };

    match cli.command.clone().unwrap_or(cli::Commands::Run { port: None }) {
        cli::Commands::Configcheck => {
            println!("\"{}\" is valid", loaded.path.display());
            ExitCode::SUCCESS
        }
        cli::Commands::Run { port } => run(loaded, port),
    }
}

fn run(mut loaded: ConfigFile, port_override: Option<u16>) -> ExitCode {
    if let Some(port) = port_override {
        loaded.config.general.port = port;
    }

    logger::init(loaded.config.general.log_format);
    info!(instance = %shardkeep::util::instance_label(), "starting shardkeep");

    let workers = loaded.config.general.workers.max(1);
    let runtime = match tokio::runtime::Builder::new_multi_thread().worker_threads(workers).enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("failed to build tokio runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run_async(loaded.config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("fatal: {err}");
            ExitCode::FAILURE
        }
    }
}

/// `ShardManagerClient::get_time` is this runner's [`clock::TimeSource`];
/// every cross-runner timestamp gets corrected against it.
struct ManagerTimeSource {
    client: Arc<dyn ShardManagerClient>,
}

#[async_trait]
impl clock::TimeSource for ManagerTimeSource {
    async fn remote_time_ms(&self) -> Result<i64, clock::Error> {
        self.client.get_time().await.map_err(|err| clock::Error::Sample(err.to_string()))
    }
}

async fn run_async(config: shardkeep_config::Config) -> Result<(), Box<dyn std::error::Error>> {
    let host: std::net::IpAddr = config.general.host.parse()?;
    let self_address = RunnerAddress::new(host, config.general.port);

    let (message_storage, runner_storage): (Arc<dyn MessageStorage>, Arc<dyn RunnerStorage>) = match config.storage.backend {
        Backend::Memory => (Arc::new(MemoryMessageStorage::new()), Arc::new(MemoryRunnerStorage::new())),
        Backend::Sql => {
            let url = config
                .storage
                .database_url
                .as_deref()
                .ok_or("storage.backend is \"sql\" but no database_url was configured")?;
            let messages = SqlMessageStorage::connect(url, config.storage.pool_size, &config.storage.table_prefix).await?;
            let locks = SqlRunnerStorage::connect(url, config.storage.pool_size, &config.storage.table_prefix).await?;
            (Arc::new(messages), Arc::new(locks))
        }
    };

    let clock = Arc::new(SynchronizedClock::new());
    let snowflake = Arc::new(Snowflake::default());
    let runners = Runners::new();

    // When this process isn't designated as the shard manager, general.port
    // is the runner's own RPC port and shard_manager_address points
    // elsewhere. When it is, we bind a second listener one port up for the
    // ShardManager RPC group rather than multiplexing both groups onto one
    // socket (see DESIGN.md, "single general.port").
    let shard_manager = if config.is_shard_manager() {
        let manager = ShardManager::new(
            config.sharding.clone(),
            runner_storage.clone(),
            runners.clone() as Arc<dyn shard_manager::RunnerHealth>,
            clock.clone(),
            config.general.persist_retry_count,
            config.general.persist_retry_interval(),
        );
        manager.restore().await?;
        manager.launch();
        Some(manager)
    } else {
        None
    };

    let manager_client: Arc<dyn ShardManagerClient> = match (&shard_manager, &config.general.shard_manager_address) {
        (Some(manager), _) => Arc::new(LocalShardManagerClient::new(manager.clone())),
        (None, Some(address)) => Arc::new(RemoteShardManagerClient::new(address.parse()?)),
        (None, None) => return Err("general.shard_manager_address is required when this process isn't the shard manager".into()),
    };

    clock.launch(Arc::new(ManagerTimeSource { client: manager_client.clone() }));

    let sharding = Sharding::new(
        self_address,
        config.sharding.shard_groups.clone(),
        config.entity.clone(),
        config.sharding.clone(),
        runners.clone(),
        manager_client.clone(),
        message_storage,
        runner_storage,
        clock.clone(),
        snowflake.clone(),
    );
    runners.bind_local(sharding.clone());

    let machine_id = manager_client
        .register(Runner::new(self_address, config.sharding.shard_groups.clone(), config.sharding.runner_shard_weight))
        .await?;
    snowflake.set_machine_id(machine_id)?;

    sharding.launch();

    let runner_listener = TcpListener::bind(self_address.socket_addr()).await?;
    info!(%self_address, "runner listening");

    let manager_listener = match &shard_manager {
        Some(_) => {
            let address = RunnerAddress::new(self_address.host, self_address.port + 1);
            let listener = TcpListener::bind(address.socket_addr()).await?;
            info!(%address, "shard manager listening");
            Some(listener)
        }
        None => None,
    };

    if let Some(port) = config.general.openmetrics_port {
        let manager = shard_manager.clone();
        let sharding = sharding.clone();
        tokio::spawn(async move {
            if let Err(err) = shardkeep::stats::serve(port, manager, sharding).await {
                error!("openmetrics endpoint failed: {err}");
            }
        });
    }

    let result = match (shard_manager.clone(), manager_listener) {
        (Some(manager), Some(manager_listener)) => {
            tokio::select! {
                err = runners::server::serve(runners.clone(), runner_listener) => Err(err),
                err = shard_manager::server::serve(manager, manager_listener) => Err(err),
                _ = tokio::signal::ctrl_c() => Ok(()),
            }
        }
        _ => {
            tokio::select! {
                err = runners::server::serve(runners.clone(), runner_listener) => Err(err),
                _ = tokio::signal::ctrl_c() => Ok(()),
            }
        }
    };

    match &result {
        Ok(()) => info!("shutdown requested"),
        Err(err) => error!("listener stopped: {err}"),
    }

    sharding.shutdown();
    if let Some(manager) = &shard_manager {
        let _ = manager_client.unregister(self_address).await;
        manager.shutdown();
    }
    clock.shutdown();

    result.map_err(|err| Box::new(err) as Box<dyn std::error::Error>)
}
