//! Provides the CLI option parser
//!
//! Used to parse the argv/config file into a struct that the uploader can
//! consume and use as configuration data. The struct is built once and only
//! ever handed out by reference afterwards.

use clap::{App, Arg};
use std::collections::BTreeSet;
use std::convert::TryFrom;
use std::error;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::batch::DEFAULT_BATCH_SIZE;
use crate::checkpoint::{self, CheckpointError};

const VERSION: Option<&'static str> = option_env!("CARGO_PKG_VERSION");

/// Event types forwarded to the broker when the configuration names none.
pub const DEFAULT_ALLOWED_EVENTS: &[&str] = &[
    "failures",
    "histogram-owdelay",
    "histogram-rtt",
    "histogram-ttl",
    "histogram-ttl-reverse",
    "ntp-delay",
    "packet-count-lost",
    "packet-count-lost-bidir",
    "packet-count-sent",
    "packet-duplicates",
    "packet-duplicates-bidir",
    "packet-loss-rate",
    "packet-loss-rate-bidir",
    "packet-reorders",
    "packet-reorders-bidir",
    "packet-retransmits",
    "packet-retransmits-subintervals",
    "packet-trace",
    "path-mtu",
    "streams-packet-retransmits",
    "streams-throughput",
    "throughput",
    "throughput-subintervals",
    "time-error-estimates",
];

fn default_tmp_directory() -> PathBuf {
    Path::new("/var/lib/perfsonar-uploader").to_path_buf()
}

fn default_version() -> String {
    VERSION.unwrap_or("unknown").to_string()
}

/// Configuration problem.
#[derive(Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    Io(io::Error),
    /// The configuration file is not valid TOML.
    Toml(toml::de::Error),
    /// A key holds a value of the wrong type or out of range.
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ConfigError::Io(ref e) => write!(f, "could not read config file: {}", e),
            ConfigError::Toml(ref e) => write!(f, "could not parse config file: {}", e),
            ConfigError::Invalid(ref why) => write!(f, "invalid configuration: {}", why),
        }
    }
}

impl error::Error for ConfigError {}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> ConfigError {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> ConfigError {
        ConfigError::Toml(e)
    }
}

/// Which `transport` implementation carries messages to the broker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    /// `transport::Tcp`
    Tcp,
    /// `transport::Console`
    Console,
    /// `transport::Null`
    Null,
}

impl TransportKind {
    fn from_name(name: &str) -> Option<TransportKind> {
        match name {
            "tcp" => Some(TransportKind::Tcp),
            "console" => Some(TransportKind::Console),
            "null" => Some(TransportKind::Null),
            _ => None,
        }
    }
}

/// Broker settings, the `[mq]` table of the configuration file.
#[derive(Clone, Debug, PartialEq)]
pub struct MqConfig {
    /// Transport carrying messages to the broker.
    pub transport: TransportKind,
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Broker virtual host.
    pub virtual_host: String,
    /// Account name.
    pub username: String,
    /// Account password.
    pub password: String,
    /// Durable queue declared before every publish.
    pub queue: String,
    /// Exchange messages are published through.
    pub exchange: String,
    /// Routing key messages are published with.
    pub routing_key: String,
    /// Largest message the broker takes, in kilobytes.
    pub max_message_size: usize,
    /// Ask the broker to keep messages across its restarts.
    pub persistent: bool,
}

impl Default for MqConfig {
    fn default() -> MqConfig {
        MqConfig {
            transport: TransportKind::Tcp,
            host: "localhost".to_string(),
            port: 5672,
            virtual_host: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            queue: "perfsonar".to_string(),
            exchange: "perfsonar".to_string(),
            routing_key: "perfsonar.raw".to_string(),
            max_message_size: 10_000,
            persistent: true,
        }
    }
}

impl MqConfig {
    /// `max_message_size` in bytes. Kilobytes here are 1000 bytes.
    pub fn max_message_bytes(&self) -> usize {
        self.max_message_size.saturating_mul(1000)
    }
}

/// Big configuration struct for the uploader executable
///
/// This struct is what we construct from parsing the configuration file and
/// command line. See `parse_args` for details.
#[derive(Clone, Debug, PartialEq)]
pub struct Args {
    /// Directory holding the checkpoint files, one per checkpoint key.
    pub tmp_directory: PathBuf,
    /// Datapoints per event type per message.
    pub batch_size: usize,
    /// Event types whose raw datapoints may be forwarded.
    pub allowed_events: BTreeSet<String>,
    /// Additional log destination, appended to.
    pub log_file: Option<PathBuf>,
    /// Collector document to upload, `-` for stdin.
    pub input: String,
    /// The verbosity setting. The higher the value the more chatty the
    /// uploader gets.
    pub verbose: u64,
    /// Version string. This is set automatically.
    pub version: String,
    /// Broker settings.
    pub mq: MqConfig,
}

impl Default for Args {
    fn default() -> Self {
        Args {
            tmp_directory: default_tmp_directory(),
            batch_size: DEFAULT_BATCH_SIZE,
            allowed_events: DEFAULT_ALLOWED_EVENTS.iter().map(|s| s.to_string()).collect(),
            log_file: None,
            input: "-".to_string(),
            verbose: 0,
            version: default_version(),
            mq: MqConfig::default(),
        }
    }
}

impl Args {
    /// Whether raw datapoints of `event_type` may be forwarded.
    pub fn is_allowed(&self, event_type: &str) -> bool {
        self.allowed_events.contains(event_type)
    }

    /// Where the checkpoint of `checkpoint_key` lives.
    ///
    /// The key must be a plain file name; anything that would resolve
    /// outside `tmp_directory` is refused.
    pub fn checkpoint_path(&self, checkpoint_key: &str) -> Result<PathBuf, CheckpointError> {
        checkpoint::validate_key(checkpoint_key)?;
        Ok(self.tmp_directory.join(checkpoint_key))
    }
}

/// Parse the uploader's command line and configuration file.
///
/// Most configuration is stored in an on-disk TOML file named by `-C`. See
/// `perfsonar-uploader --help` for the command line itself.
pub fn parse_args() -> Result<Args, ConfigError> {
    let args = App::new("perfsonar-uploader")
        .version(VERSION.unwrap_or("unknown"))
        .about("publish perfSONAR measurements to a message broker, resumably")
        .arg(
            Arg::with_name("config-file")
                .long("config")
                .short("C")
                .value_name("config")
                .required(true)
                .help("The config file to feed in.")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("input")
                .long("input")
                .short("i")
                .value_name("file")
                .help("The collector document to upload, - for stdin.")
                .takes_value(true)
                .default_value("-"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .help("Turn on verbose output."),
        )
        .get_matches();

    let verb = args.occurrences_of("verbose");
    let filename = args
        .value_of("config-file")
        .ok_or_else(|| ConfigError::Invalid("no config file given".to_string()))?;
    let mut config = read_config_file(Path::new(filename), verb)?;
    if let Some(input) = args.value_of("input") {
        config.input = input.to_string();
    }
    Ok(config)
}

/// Read and parse the configuration file at `path`.
pub fn read_config_file(path: &Path, verbosity: u64) -> Result<Args, ConfigError> {
    let mut fp = File::open(path)?;
    let mut buffer = String::new();
    fp.read_to_string(&mut buffer)?;
    parse_config_file(&buffer, verbosity)
}

fn invalid(key: &str, expected: &str) -> ConfigError {
    ConfigError::Invalid(format!("{} must be {}", key, expected))
}

fn get_str(tbl: &toml::Value, key: &str) -> Result<Option<String>, ConfigError> {
    match tbl.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| invalid(key, "a string")),
    }
}

fn get_int(tbl: &toml::Value, key: &str) -> Result<Option<i64>, ConfigError> {
    match tbl.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_integer()
            .map(Some)
            .ok_or_else(|| invalid(key, "an integer")),
    }
}

fn get_positive(tbl: &toml::Value, key: &str) -> Result<Option<usize>, ConfigError> {
    match get_int(tbl, key)? {
        None => Ok(None),
        Some(i) if i > 0 => usize::try_from(i)
            .map(Some)
            .map_err(|_| invalid(key, "a positive integer")),
        Some(_) => Err(invalid(key, "a positive integer")),
    }
}

fn get_bool(tbl: &toml::Value, key: &str) -> Result<Option<bool>, ConfigError> {
    match tbl.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| invalid(key, "a boolean")),
    }
}

fn get_str_array(tbl: &toml::Value, key: &str) -> Result<Option<Vec<String>>, ConfigError> {
    match tbl.get(key) {
        None => Ok(None),
        Some(v) => {
            let arr = v.as_array().ok_or_else(|| invalid(key, "an array"))?;
            arr.iter()
                .map(|s| {
                    s.as_str()
                        .map(|s| s.to_string())
                        .ok_or_else(|| invalid(key, "an array of strings"))
                })
                .collect::<Result<Vec<String>, ConfigError>>()
                .map(Some)
        }
    }
}

fn parse_mq(tbl: &toml::Value) -> Result<MqConfig, ConfigError> {
    let mut mq = MqConfig::default();

    if let Some(name) = get_str(tbl, "transport")? {
        mq.transport = TransportKind::from_name(&name)
            .ok_or_else(|| invalid("transport", "one of tcp, console, null"))?;
    }
    mq.host = get_str(tbl, "host")?.unwrap_or(mq.host);
    if let Some(port) = get_int(tbl, "port")? {
        mq.port = u16::try_from(port).map_err(|_| invalid("port", "a valid port number"))?;
    }
    mq.virtual_host = get_str(tbl, "virtual-host")?.unwrap_or(mq.virtual_host);
    mq.username = get_str(tbl, "username")?.unwrap_or(mq.username);
    mq.password = get_str(tbl, "password")?.unwrap_or(mq.password);
    mq.queue = get_str(tbl, "queue")?.unwrap_or(mq.queue);
    mq.exchange = get_str(tbl, "exchange")?.unwrap_or(mq.exchange);
    mq.routing_key = get_str(tbl, "routing-key")?.unwrap_or(mq.routing_key);
    mq.max_message_size = get_positive(tbl, "max-message-size")?.unwrap_or(mq.max_message_size);
    mq.persistent = get_bool(tbl, "persistent")?.unwrap_or(mq.persistent);

    Ok(mq)
}

/// Parse the uploader configuration file.
///
/// Every key is optional. An example:
///
/// ```toml
/// tmp-directory = "/var/lib/perfsonar-uploader"
/// batch-size = 100
/// allowed-events = ["packet-loss-rate", "histogram-owdelay"]
///
/// [mq]
/// transport = "tcp"
/// host = "broker.example.org"
/// max-message-size = 10000
/// ```
pub fn parse_config_file(buffer: &str, verbosity: u64) -> Result<Args, ConfigError> {
    let mut args = Args::default();
    let value: toml::Value = toml::from_str(buffer)?;

    args.verbose = verbosity;

    args.tmp_directory = get_str(&value, "tmp-directory")?
        .map(PathBuf::from)
        .unwrap_or(args.tmp_directory);

    args.batch_size = get_positive(&value, "batch-size")?.unwrap_or(args.batch_size);

    if let Some(events) = get_str_array(&value, "allowed-events")? {
        args.allowed_events = events.into_iter().collect();
    }

    args.log_file = get_str(&value, "log-file")?.map(PathBuf::from);

    if let Some(mq) = value.get("mq") {
        if !mq.is_table() {
            return Err(invalid("mq", "a table"));
        }
        args.mq = parse_mq(mq)?;
    }

    Ok(args)
}
