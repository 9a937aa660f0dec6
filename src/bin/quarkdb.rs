/*
 * quarkdb is the QuarkDB server. It takes configuration via a configuration
 * file, command-line parameters, and environment variables, then starts a
 * TCP server speaking the Redis wire protocol towards clients and Raft
 * peers alike.
 */

#![warn(clippy::all)]

use serde_derive::Deserialize;
use std::time::Duration;

use quarkdb::error::Result;
use quarkdb::errinput;
use quarkdb::node::QuarkDBNode;
use quarkdb::raft::{RaftServer, Timeouts, TrimConfig};
use quarkdb::shard::{EngineKind, ShardConfig, ShardMode};
use quarkdb::Server;

fn main() -> Result<()> {
    let args = clap::command!()
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .help("Configuration file path")
                .default_value("config/quarkdb.toml"),
        )
        .get_matches();
    let cfg = Config::new(args.get_one::<String>("config").unwrap().as_ref())?;

    let loglevel = cfg.log_level.parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("quarkdb");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    let mode = match cfg.mode.as_str() {
        "raft" | "" => {
            let myself = RaftServer::parse(&cfg.myself)?;
            let nodes = cfg
                .nodes
                .split(',')
                .map(RaftServer::parse)
                .collect::<Result<Vec<_>>>()?;
            if !nodes.contains(&myself) {
                return errinput!("myself {myself} is not part of nodes {}", cfg.nodes);
            }
            ShardMode::Raft {
                myself,
                nodes,
                cluster_id: cfg.cluster_id.clone(),
                timeouts: Timeouts::new(
                    Duration::from_millis(cfg.timeout_low_ms),
                    Duration::from_millis(cfg.timeout_high_ms),
                    Duration::from_millis(cfg.heartbeat_ms),
                ),
                trim: TrimConfig { threshold: cfg.trim_threshold, keep: cfg.trim_keep },
            }
        }
        "standalone" => ShardMode::Standalone,
        name => return errinput!("invalid mode {name}"),
    };

    let node = QuarkDBNode::new(ShardConfig {
        base_dir: cfg.data_dir.into(),
        engine: EngineKind::parse(&cfg.storage)?,
        mode,
        bulkload: cfg.bulkload,
    })?;
    Server::new(node).serve(&cfg.listen)
}

#[derive(Debug, Deserialize)]
struct Config {
    /// The mode to run in: "raft" or "standalone".
    mode: String,
    /// This node's identity as host:port; must resolve to an interface the
    /// listen address covers.
    myself: String,
    /// The full member set of the cluster, as comma-separated host:port
    /// pairs.
    nodes: String,
    cluster_id: String,
    listen: String,
    log_level: String,
    data_dir: String,
    storage: String,
    bulkload: bool,
    timeout_low_ms: u64,
    timeout_high_ms: u64,
    heartbeat_ms: u64,
    trim_threshold: i64,
    trim_keep: i64,
}

impl Config {
    fn new(file: &str) -> Result<Self> {
        Ok(config::Config::builder()
            .set_default("mode", "raft")?
            .set_default("myself", "localhost:7777")?
            .set_default("nodes", "localhost:7777")?
            .set_default("cluster_id", "quarkdb-cluster")?
            .set_default("listen", "0.0.0.0:7777")?
            .set_default("log_level", "info")?
            .set_default("data_dir", "data")?
            .set_default("storage", "bitcask")?
            .set_default("bulkload", false)?
            .set_default("timeout_low_ms", 1000)?
            .set_default("timeout_high_ms", 1500)?
            .set_default("heartbeat_ms", 250)?
            .set_default("trim_threshold", 1_000_000)?
            .set_default("trim_keep", 900_000)?
            .add_source(config::File::with_name(file).required(false))
            .add_source(config::Environment::with_prefix("QUARKDB"))
            .build()?
            .try_deserialize()?)
    }
}
