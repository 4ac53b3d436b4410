//! Command-line and environment configuration for a node.

use crate::core::genesis::{DEFAULT_CHAIN_ID, DEFAULT_DIFFICULTY, DEFAULT_TRANS_PER_BLOCK, Genesis};
use crate::network::peer::Peer;
use crate::network::server::ServerOps;
use crate::types::address::Address;
use crate::utils::log::Level;
use powchain_derive::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable naming the signing key file.
pub const KEY_FILE_ENV: &str = "NODE_KEY_FILE";
/// Environment variable holding the log level.
pub const LOG_LEVEL_ENV: &str = "POWCHAIN_LOG";

pub const DEFAULT_DATA_DIR: &str = "./powchain-data";
pub const DEFAULT_KEY_FILE: &str = "node.key";
pub const DEFAULT_BLOCK_TIME_SECS: u64 = 10;
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_PEER_TIMEOUT_MS: u64 = 3000;

pub const USAGE: &str = "\
Proof-of-work blockchain node

USAGE:
    {program} <listen_addr> [OPTIONS]

ARGS:
    <listen_addr>              Local address to bind (e.g., 127.0.0.1:3000)

OPTIONS:
    --peer <addr>              Peer to sync with; repeatable
    --advertise <addr>         Address announced to peers (defaults to listen_addr)
    --key <file>               Signing key file, created if missing
                               (default: <data-dir>/node.key)
    --data-dir <dir>           Block log directory (default: ./powchain-data)
    --mine                     Mine blocks and collect tips
    --block-time <secs>        Seconds between mining attempts (default: 10)
    --sync-interval <secs>     Seconds between peer sync rounds (default: 15)
    --peer-timeout <millis>    Per-request peer deadline (default: 3000)
    --chain-id <id>            Chain id signed into transactions (default: 1)
    --difficulty <bits>        Leading zero bits required of block hashes (default: 16)
    --trans-per-block <n>      Most transactions per block (default: 10)
    --mining-reward <amount>   Credited to the miner of each block (default: 0)
    --fund <0xaddr=amount>     Genesis balance; repeatable
    --log-level <level>        debug, info, warn or error (default: info)
    -h, --help                 Print this help message

ENVIRONMENT:
    NODE_KEY_FILE    Signing key file, when --key is not given
    POWCHAIN_LOG     Log level, when --log-level is not given

EXAMPLES:
    # Mine on a fresh chain with one funded account
    {program} 127.0.0.1:3000 --mine --fund 0x5f2a...c1=1000

    # Follow an existing node
    {program} 127.0.0.1:3001 --peer 127.0.0.1:3000 --data-dir ./node-b --fund 0x5f2a...c1=1000

All nodes on one chain must use the same --chain-id, --difficulty,
--trans-per-block, --mining-reward and --fund values.
";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("help requested")]
    Help,

    #[error("missing <listen_addr>")]
    MissingListenAddr,

    #[error("{0} requires an argument")]
    MissingValue(String),

    #[error("invalid value '{value}' for {flag}: {reason}")]
    InvalidValue {
        flag: String,
        value: String,
        reason: String,
    },

    #[error("unexpected argument: {0}")]
    UnexpectedArgument(String),
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen_addr: SocketAddr,
    pub advertise: String,
    pub peers: Vec<Peer>,
    pub key_file: PathBuf,
    pub data_dir: PathBuf,
    pub mine: bool,
    pub block_time: Duration,
    pub sync_interval: Duration,
    pub peer_timeout: Duration,
    pub genesis: Genesis,
    pub log_level: Level,
}

impl NodeConfig {
    /// Parses `args` (without the program name), reading fallbacks from the
    /// process environment.
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        Self::from_args_with_env(args, |name| std::env::var(name).ok())
    }

    pub fn from_args_with_env(
        args: &[String],
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut args = args.iter();
        let listen_arg = match args.next().map(String::as_str) {
            None => return Err(ConfigError::MissingListenAddr),
            Some("-h") | Some("--help") => return Err(ConfigError::Help),
            Some(arg) => arg,
        };
        let listen_addr: SocketAddr = parse("<listen_addr>", listen_arg)?;

        let mut advertise = None;
        let mut peers = Vec::new();
        let mut key_file = env(KEY_FILE_ENV).map(PathBuf::from);
        let mut data_dir = PathBuf::from(DEFAULT_DATA_DIR);
        let mut mine = false;
        let mut block_time = DEFAULT_BLOCK_TIME_SECS;
        let mut sync_interval = DEFAULT_SYNC_INTERVAL_SECS;
        let mut peer_timeout = DEFAULT_PEER_TIMEOUT_MS;
        let mut log_level = match env(LOG_LEVEL_ENV) {
            Some(level) => parse(LOG_LEVEL_ENV, &level)?,
            None => Level::Info,
        };
        let mut genesis = Genesis {
            chain_id: DEFAULT_CHAIN_ID,
            difficulty: DEFAULT_DIFFICULTY,
            trans_per_block: DEFAULT_TRANS_PER_BLOCK,
            ..Genesis::default()
        };

        while let Some(flag) = args.next() {
            let flag = flag.as_str();
            let mut value = || {
                args.next()
                    .map(String::as_str)
                    .ok_or_else(|| ConfigError::MissingValue(flag.to_string()))
            };
            match flag {
                "-h" | "--help" => return Err(ConfigError::Help),
                "--mine" => mine = true,
                "--peer" => {
                    let addr: SocketAddr = parse(flag, value()?)?;
                    peers.push(Peer::new(addr.to_string()));
                }
                "--advertise" => advertise = Some(value()?.to_string()),
                "--key" => key_file = Some(PathBuf::from(value()?)),
                "--data-dir" => data_dir = PathBuf::from(value()?),
                "--block-time" => block_time = positive(flag, value()?)?,
                "--sync-interval" => sync_interval = positive(flag, value()?)?,
                "--peer-timeout" => peer_timeout = positive(flag, value()?)?,
                "--chain-id" => genesis.chain_id = parse(flag, value()?)?,
                "--difficulty" => genesis.difficulty = parse(flag, value()?)?,
                "--trans-per-block" => genesis.trans_per_block = positive(flag, value()?)? as usize,
                "--mining-reward" => genesis.mining_reward = parse(flag, value()?)?,
                "--fund" => genesis.balances.push(parse_fund(value()?)?),
                "--log-level" => log_level = parse(flag, value()?)?,
                other => return Err(ConfigError::UnexpectedArgument(other.to_string())),
            }
        }

        Ok(Self {
            listen_addr,
            advertise: advertise.unwrap_or_else(|| listen_addr.to_string()),
            peers,
            key_file: key_file.unwrap_or_else(|| data_dir.join(DEFAULT_KEY_FILE)),
            data_dir,
            mine,
            block_time: Duration::from_secs(block_time),
            sync_interval: Duration::from_secs(sync_interval),
            peer_timeout: Duration::from_millis(peer_timeout),
            genesis,
            log_level,
        })
    }

    pub fn server_ops(&self) -> ServerOps {
        ServerOps {
            mine: self.mine,
            block_time: self.block_time,
            sync_interval: self.sync_interval,
        }
    }
}

fn parse<T>(flag: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        flag: flag.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn positive(flag: &str, value: &str) -> Result<u64, ConfigError> {
    match parse::<u64>(flag, value)? {
        0 => Err(ConfigError::InvalidValue {
            flag: flag.to_string(),
            value: value.to_string(),
            reason: "must be greater than zero".into(),
        }),
        n => Ok(n),
    }
}

/// `0x<40 hex>=<amount>`
fn parse_fund(value: &str) -> Result<(Address, u64), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidValue {
        flag: "--fund".into(),
        value: value.to_string(),
        reason,
    };
    let (address, amount) = value
        .split_once('=')
        .ok_or_else(|| invalid("expected <0xaddr>=<amount>".into()))?;
    let address: Address = address.parse().map_err(|e| invalid(format!("{e}")))?;
    let amount: u64 = amount.parse().map_err(|e| invalid(format!("{e}")))?;
    Ok((address, amount))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults() {
        let config = NodeConfig::from_args_with_env(&args(&["127.0.0.1:3000"]), no_env).unwrap();
        assert_eq!(config.advertise, "127.0.0.1:3000");
        assert_eq!(config.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
        assert_eq!(config.key_file, PathBuf::from(DEFAULT_DATA_DIR).join(DEFAULT_KEY_FILE));
        assert_eq!(config.block_time, Duration::from_secs(10));
        assert_eq!(config.peer_timeout, Duration::from_millis(3000));
        assert_eq!(config.genesis.difficulty, DEFAULT_DIFFICULTY);
        assert_eq!(config.log_level, Level::Info);
        assert!(!config.mine);
    }

    #[test]
    fn full_command_line() {
        let addr = Address([0xab; 20]);
        let fund = format!("{addr}=1000");
        let config = NodeConfig::from_args_with_env(
            &args(&[
                "0.0.0.0:3001",
                "--peer",
                "127.0.0.1:3000",
                "--peer",
                "127.0.0.1:3002",
                "--advertise",
                "10.0.0.5:3001",
                "--mine",
                "--difficulty",
                "12",
                "--chain-id",
                "9",
                "--mining-reward",
                "5",
                "--fund",
                &fund,
                "--block-time",
                "2",
                "--log-level",
                "debug",
            ]),
            no_env,
        )
        .unwrap();
        assert_eq!(config.peers, vec![Peer::new("127.0.0.1:3000"), Peer::new("127.0.0.1:3002")]);
        assert_eq!(config.advertise, "10.0.0.5:3001");
        assert!(config.mine);
        assert_eq!(config.genesis.difficulty, 12);
        assert_eq!(config.genesis.chain_id, 9);
        assert_eq!(config.genesis.mining_reward, 5);
        assert_eq!(config.genesis.balances, vec![(addr, 1000)]);
        assert_eq!(config.block_time, Duration::from_secs(2));
        assert_eq!(config.log_level, Level::Debug);
    }

    #[test]
    fn environment_fallbacks() {
        let env = |name: &str| match name {
            KEY_FILE_ENV => Some("/keys/a.key".to_string()),
            LOG_LEVEL_ENV => Some("warn".to_string()),
            _ => None,
        };
        let config = NodeConfig::from_args_with_env(&args(&["127.0.0.1:3000"]), env).unwrap();
        assert_eq!(config.key_file, PathBuf::from("/keys/a.key"));
        assert_eq!(config.log_level, Level::Warn);

        let flags = args(&["127.0.0.1:3000", "--key", "b.key"]);
        let config = NodeConfig::from_args_with_env(&flags, env).unwrap();
        assert_eq!(config.key_file, PathBuf::from("b.key"));
    }

    #[test]
    fn errors() {
        let parse =
            |list: &[&str]| NodeConfig::from_args_with_env(&args(list), no_env).unwrap_err();
        assert_eq!(parse(&[]), ConfigError::MissingListenAddr);
        assert_eq!(parse(&["--help"]), ConfigError::Help);
        assert_eq!(parse(&["127.0.0.1:1", "--peer"]), ConfigError::MissingValue("--peer".into()));
        assert!(matches!(parse(&["nowhere"]), ConfigError::InvalidValue { .. }));
        assert!(matches!(
            parse(&["127.0.0.1:1", "--block-time", "0"]),
            ConfigError::InvalidValue { .. }
        ));
        assert!(matches!(
            parse(&["127.0.0.1:1", "--fund", "0x12=5"]),
            ConfigError::InvalidValue { .. }
        ));
        assert_eq!(
            parse(&["127.0.0.1:1", "--verbose"]),
            ConfigError::UnexpectedArgument("--verbose".into())
        );
    }
}
