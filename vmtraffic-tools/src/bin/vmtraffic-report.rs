use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use tokio::io::{stdout, AsyncWriteExt};
use vmtraffic::{
    config::Config,
    query::QueryFacade,
    store::sqlite::SqliteStore,
};
use vmtraffic_common::model::VmIdentity;

/// Print collected traffic as JSON, reading the vmtraffic database.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the traffic database.
    #[arg(short, long, default_value = "/var/lib/vmtraffic/traffic.db")]
    database: PathBuf,

    /// Daemon configuration, for dashboard thresholds.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Debug)]
struct Vm {
    /// Connection id
    connection: String,
    /// Node name
    node: String,
    vmid: u32,
}

impl Vm {
    fn identity(&self) -> VmIdentity {
        VmIdentity::new(&self.connection, &self.node, self.vmid)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Latest counters of a VM.
    Current(Vm),
    /// Hour bucket of a VM.
    Hourly {
        #[command(flatten)]
        vm: Vm,
        /// `YYYY-MM-DD-HH`, current hour by default.
        #[arg(long)]
        hour: Option<String>,
    },
    /// Day bucket of a VM.
    Daily {
        #[command(flatten)]
        vm: Vm,
        /// `YYYY-MM-DD`, today by default.
        #[arg(long)]
        day: Option<String>,
    },
    /// Consecutive hour buckets ending now.
    History {
        #[command(flatten)]
        vm: Vm,
        #[arg(long, default_value_t = 24)]
        hours: usize,
    },
    /// Every VM's bucket for one hour, heaviest first.
    AllHourly {
        #[arg(long)]
        hour: Option<String>,
    },
    /// Every VM's bucket for one day, heaviest first.
    AllDaily {
        #[arg(long)]
        day: Option<String>,
    },
    /// Current hour overview with alerts.
    Dashboard,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let store = SqliteStore::open_read_only(&args.database)
        .await
        .with_context(|| format!("Unable to open {}", args.database.display()))?;

    let query = QueryFacade::new(Arc::new(store), config.dashboard_settings());

    let output = match &args.command {
        Command::Current(vm) => serde_json::to_value(query.current_of(&vm.identity()).await?)?,
        Command::Hourly { vm, hour } => {
            serde_json::to_value(query.hourly_of(&vm.identity(), hour.as_deref()).await?)?
        }
        Command::Daily { vm, day } => {
            serde_json::to_value(query.daily_of(&vm.identity(), day.as_deref()).await?)?
        }
        Command::History { vm, hours } => {
            let history: Vec<_> = query.history_of(&vm.identity(), *hours).await?.collect();
            serde_json::to_value(history)?
        }
        Command::AllHourly { hour } => serde_json::to_value(query.all_hourly(hour.as_deref()).await?)?,
        Command::AllDaily { day } => serde_json::to_value(query.all_daily(day.as_deref()).await?)?,
        Command::Dashboard => serde_json::to_value(query.dashboard_snapshot().await?)?,
    };

    let mut rendered = serde_json::to_vec_pretty(&output)?;
    rendered.push(b'\n');

    stdout().write_all(&rendered).await?;

    Ok(())
}
