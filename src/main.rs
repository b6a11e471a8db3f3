use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dirstore::cursor::Cursor;
use dirstore::schema::StaticSchema;
use dirstore::{Id, SearchScope, Store, StoreConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dirstore")]
#[command(about = "Inspect and maintain a dirstore partition")]
struct Args {
    /// 配置文件（TOML）；缺省读取平台配置目录下的 dirstore/config.toml（若存在）
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// 工作目录，覆盖配置文件里的 working_dir
    #[arg(short, long, value_name = "DIR")]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a store report
    Info,
    /// Print one entry as JSON
    Get { id: Id },
    /// List the direct children of an entry (0 = root)
    Children { id: Id },
    /// List the ids under an entry, the entry itself included (0 = whole tree)
    Subtree { id: Id },
    /// Print every entry as one JSON line
    Dump,
    /// Check master / index consistency
    Verify,
    /// Write checkpoints for every structure and truncate journals
    Checkpoint,
}

fn load_config(args: &Args) -> anyhow::Result<StoreConfig> {
    let mut config = match &args.config {
        Some(path) => StoreConfig::load(path)?,
        None => match StoreConfig::default_path().filter(|p| p.exists()) {
            Some(path) => StoreConfig::load(&path)?,
            None => StoreConfig::default(),
        },
    };
    if let Some(dir) = &args.dir {
        config.working_dir = Some(dir.clone());
    }
    if config.working_dir.is_none() {
        config.working_dir = Some(StoreConfig::default_working_dir());
    }
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    info!("Opening dirstore at {:?}", config.working_dir);

    let store = Store::open(config, Arc::new(StaticSchema::with_defaults()))
        .context("opening store")?;

    let outcome = run(&store, &args.command);
    let closed = store.close().context("closing store");
    outcome?;
    closed
}

fn run(store: &Store, command: &Command) -> anyhow::Result<()> {
    match command {
        Command::Info => {
            print!("{}", store.stats()?);
        }
        Command::Get { id } => {
            let entry = store.lookup(*id)?;
            let line = serde_json::json!({
                "id": id,
                "dn": store.dn_string(*id)?,
                "entry": entry,
            });
            println!("{}", serde_json::to_string_pretty(&line)?);
        }
        Command::Children { id } => {
            for tuple in store.children(*id)?.elements() {
                let tuple = tuple?;
                println!("{:>10}  {}", tuple.value, tuple.key.rdn);
            }
        }
        Command::Subtree { id } => {
            let mut cursor = store.scope(*id, SearchScope::Subtree)?;
            while cursor.next()? {
                let id = cursor.get()?;
                println!("{:>10}  {}", id, store.dn_string(id)?);
            }
            cursor.close()?;
        }
        Command::Dump => {
            let mut cursor = store.master().cursor()?;
            while cursor.next()? {
                let tuple = cursor.get()?;
                let line = serde_json::json!({
                    "id": tuple.key,
                    "dn": store.dn_string(tuple.key)?,
                    "entry": tuple.value,
                });
                println!("{}", serde_json::to_string(&line)?);
            }
        }
        Command::Verify => {
            let problems = store.verify()?;
            for p in &problems {
                println!("{p}");
            }
            if !problems.is_empty() {
                anyhow::bail!("{} consistency problem(s) found", problems.len());
            }
            println!("ok");
        }
        Command::Checkpoint => {
            store.sync()?;
            info!("Checkpoint written");
        }
    }
    Ok(())
}
