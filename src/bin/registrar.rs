//! shard-registrar binary

use clap::{Parser, Subcommand};
use shard_registrar::common::{format_duration, holder_prefix, parse_duration};
use shard_registrar::{
    Config, MemoryBus, MemoryStore, RegistrarConfig, ShardInfo, ShardRegistrar, StopOptions,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "shard-registrar")]
#[command(about = "Lease-based shard assignment over a shared store")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the reservation schema
    #[cfg(feature = "postgres")]
    Migrate {
        /// Postgres connection string (falls back to the config file)
        #[arg(long)]
        database_url: Option<String>,

        /// Read migrations from a directory instead of the built-in set
        #[arg(long)]
        dir: Option<std::path::PathBuf>,

        #[command(subcommand)]
        action: MigrateAction,
    },

    /// Join a cluster and log assignments until interrupted
    #[cfg(feature = "postgres")]
    Join {
        /// Postgres connection string (falls back to the config file)
        #[arg(long)]
        database_url: Option<String>,

        #[command(flatten)]
        registrar: RegistrarArgs,

        /// Delete the reservation on exit instead of letting it expire
        #[arg(long)]
        unregister_on_exit: bool,
    },

    /// Run several registrars in-process and print the converged assignment
    Simulate {
        #[command(flatten)]
        registrar: RegistrarArgs,

        /// Number of holders
        #[arg(long, default_value = "3")]
        holders: usize,

        /// Give up waiting for convergence after this long
        #[arg(long, default_value = "30s", value_parser = duration_arg)]
        timeout: Duration,
    },
}

#[cfg(feature = "postgres")]
#[derive(Subcommand)]
enum MigrateAction {
    /// Apply pending migrations
    Up,
    /// Revert the most recent migrations
    Down {
        #[arg(long, default_value = "1")]
        steps: usize,
    },
    /// List migrations and whether they are applied
    Status,
}

#[derive(clap::Args)]
struct RegistrarArgs {
    /// Cluster to join (falls back to the config file)
    #[arg(long)]
    cluster: Option<String>,

    /// Heartbeat interval, e.g. `10s` or `500ms`
    #[arg(long, value_parser = duration_arg)]
    heartbeat: Option<Duration>,

    /// Grace period added to the lease
    #[arg(long, value_parser = duration_arg)]
    grace: Option<Duration>,

    /// Minimum time between reshards
    #[arg(long, value_parser = duration_arg)]
    reshard: Option<Duration>,
}

fn duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

impl RegistrarArgs {
    /// CLI flags take priority over the config file
    fn resolve(self, config: &Config) -> anyhow::Result<RegistrarConfig> {
        let mut resolved = match (self.cluster, config.registrar.clone()) {
            (Some(cluster), Some(file_conf)) => RegistrarConfig { cluster, ..file_conf },
            (Some(cluster), None) => RegistrarConfig::new(cluster),
            (None, Some(file_conf)) => file_conf,
            (None, None) => anyhow::bail!("--cluster is required (or set registrar.cluster in the config file)"),
        };
        if let Some(heartbeat) = self.heartbeat {
            resolved.heartbeat_interval = heartbeat;
        }
        if let Some(grace) = self.grace {
            resolved.grace_period = grace;
        }
        if let Some(reshard) = self.reshard {
            resolved.reshard_interval = reshard;
        }
        resolved.validate()?;
        Ok(resolved)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        #[cfg(feature = "postgres")]
        Commands::Migrate {
            database_url,
            dir,
            action,
        } => {
            use shard_registrar::migrate::{self, Migrator};

            let url = database_url_or_config(database_url, &config)?;
            let store = shard_registrar::PgStore::connect(&url, config.max_connections).await?;
            let migrations = match dir {
                Some(dir) => migrate::discover(dir)?,
                None => migrate::embedded()?,
            };
            let migrator = Migrator::new(Arc::new(store), migrations);

            match action {
                MigrateAction::Up => {
                    let applied = migrator.up().await?;
                    if applied.is_empty() {
                        println!("Schema is up to date");
                    }
                    for name in applied {
                        println!("applied  {}", name);
                    }
                }
                MigrateAction::Down { steps } => {
                    for name in migrator.down(steps).await? {
                        println!("reverted {}", name);
                    }
                }
                MigrateAction::Status => {
                    for (name, applied) in migrator.status().await? {
                        println!("{}  {}", if applied { "[x]" } else { "[ ]" }, name);
                    }
                }
            }
        }

        #[cfg(feature = "postgres")]
        Commands::Join {
            database_url,
            registrar,
            unregister_on_exit,
        } => {
            use shard_registrar::{PgBus, PgStore, RegistrarEvent};

            let url = database_url_or_config(database_url, &config)?;
            let registrar_config = registrar.resolve(&config)?;
            let store = PgStore::connect(&url, config.max_connections).await?;
            let bus = PgBus::connect(store.pool().clone()).await?;

            let registrar = ShardRegistrar::new(registrar_config, Arc::new(store), Arc::new(bus))?;
            let mut events = registrar.subscribe();
            registrar.start().await?;
            tracing::info!(
                "Holder {} joined cluster {}",
                registrar.holder(),
                registrar.cluster()
            );

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(RegistrarEvent::ShardChanged(info)) => println!("{}", info),
                        Ok(RegistrarEvent::Error(e)) => tracing::warn!("{}", e),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("Missed {} events", n);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }

            let options = StopOptions {
                unregister: unregister_on_exit,
            };
            registrar.stop(options).await;
            tracing::debug!(
                "{}",
                registrar
                    .metrics()
                    .to_prometheus(registrar.cluster(), registrar.holder())
            );
        }

        Commands::Simulate {
            registrar,
            holders,
            timeout,
        } => {
            let registrar_config = registrar.resolve(&config)?;
            simulate(registrar_config, holders, timeout).await?;
        }
    }

    Ok(())
}

#[cfg(feature = "postgres")]
fn database_url_or_config(url: Option<String>, config: &Config) -> anyhow::Result<String> {
    url.or_else(|| config.database_url.clone()).ok_or_else(|| {
        anyhow::anyhow!("--database-url is required (or set database_url in the config file)")
    })
}

async fn simulate(config: RegistrarConfig, holders: usize, timeout: Duration) -> anyhow::Result<()> {
    let bus = Arc::new(MemoryBus::new());
    let store = Arc::new(MemoryStore::new(bus.clone()));

    let registrars = (0..holders)
        .map(|_| ShardRegistrar::new(config.clone(), store.clone(), bus.clone()))
        .collect::<shard_registrar::Result<Vec<_>>>()?;
    futures_util::future::try_join_all(registrars.iter().map(|r| r.start())).await?;

    let started = tokio::time::Instant::now();
    let converged = loop {
        let assigned: Vec<Option<ShardInfo>> =
            registrars.iter().map(|r| r.shard_info().ok()).collect();
        if is_converged(&assigned) {
            break true;
        }
        if started.elapsed() >= timeout {
            break false;
        }
        tokio::time::sleep(config.heartbeat_interval / 2).await;
    };

    println!(
        "cluster {} with {} holders ({} after {})",
        config.cluster,
        holders,
        if converged { "converged" } else { "NOT converged" },
        format_duration(started.elapsed())
    );
    for registrar in &registrars {
        let shard = registrar
            .shard_info()
            .map(|info| info.to_string())
            .unwrap_or_else(|_| "-".to_string());
        println!("  {}  {}", holder_prefix(registrar.holder()), shard);
    }

    futures_util::future::join_all(
        registrars
            .iter()
            .map(|r| r.stop(StopOptions::unregister())),
    )
    .await;

    if !converged {
        anyhow::bail!("holders did not converge within {}", format_duration(timeout));
    }
    Ok(())
}

/// Every holder has a distinct shard out of `0..N`, all agreeing on `N`
fn is_converged(assigned: &[Option<ShardInfo>]) -> bool {
    let n = assigned.len() as u32;
    let mut seen = vec![false; assigned.len()];
    for info in assigned {
        let Some(info) = info else {
            return false;
        };
        if info.num_shards != n || seen[info.shard as usize] {
            return false;
        }
        seen[info.shard as usize] = true;
    }
    true
}
