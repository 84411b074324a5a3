use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;

use crate::slipstream::{
    net,
    tunnel::{
        resolver::{DEFAULT_QUERY_TIMEOUT, TUNNEL_SERVER_PORT},
        transport::{CongestionControl, QuicDialOptions},
    },
};

pub const DEFAULT_RESOLVER: &str = "8.8.8.8:53";
pub const DEFAULT_TCP_LISTEN_PORT: u16 = 5201;
pub const DEFAULT_KEEP_ALIVE_MS: u64 = 120_000;

/// Command line flags. Every flag can also be set through its environment
/// variable or the config file; flags win, then env, then the file.
#[derive(Debug, Parser)]
#[command(
    name = "slipstream",
    version,
    about = "Slipstream - tunnel local TCP connections over QUIC to an endpoint found through DNS"
)]
pub struct Cli {
    /// Path to a config file (.toml/.yaml/.yml). If omitted, auto-detects slipstream.toml > slipstream.yaml > slipstream.yml from CWD, then the OS default path (Linux: /etc/slipstream/slipstream.toml); running without any file is fine.
    #[arg(long, env = "SLIPSTREAM_CONFIG")]
    pub config: Option<PathBuf>,

    /// DNS resolver used to discover the tunnel endpoint, IP[:PORT] [default: 8.8.8.8:53]
    #[arg(long, env = "SLIPSTREAM_RESOLVER")]
    pub resolver: Option<String>,

    /// DNS query timeout in milliseconds [default: 5000]
    #[arg(long, env = "SLIPSTREAM_DNS_TIMEOUT")]
    pub dns_timeout: Option<u64>,

    /// Tunnel domain; its A/AAAA record points at the tunnel server (required)
    #[arg(long, env = "SLIPSTREAM_DOMAIN")]
    pub domain: Option<String>,

    /// Local TCP port, bound on 127.0.0.1 [default: 5201]
    #[arg(long, env = "SLIPSTREAM_TCP_LISTEN_PORT")]
    pub tcp_listen_port: Option<u16>,

    /// QUIC keep-alive interval in milliseconds; 0 disables [default: 120000]
    #[arg(long, env = "SLIPSTREAM_KEEP_ALIVE_INTERVAL")]
    pub keep_alive_interval: Option<u64>,

    /// QUIC idle timeout in milliseconds [default: twice the keep-alive, or 30000]
    #[arg(long, env = "SLIPSTREAM_IDLE_TIMEOUT")]
    pub idle_timeout: Option<u64>,

    /// Congestion control: cubic | bbr | newreno [default: cubic]
    #[arg(long, env = "SLIPSTREAM_CONGESTION_CONTROL")]
    pub congestion_control: Option<String>,

    /// Enable UDP generic segmentation offload
    #[arg(long, env = "SLIPSTREAM_GSO", num_args = 0..=1, default_missing_value = "true")]
    pub gso: Option<bool>,

    /// Tunnel server UDP port [default: 5300]
    #[arg(long, env = "SLIPSTREAM_SERVER_PORT")]
    pub server_port: Option<u16>,

    /// TLS server name (SNI) [default: the tunnel domain]
    #[arg(long, env = "SLIPSTREAM_SERVER_NAME")]
    pub server_name: Option<String>,

    /// DANGEROUS: accept any server certificate. Anyone on the path can impersonate the tunnel server.
    #[arg(
        long,
        env = "SLIPSTREAM_INSECURE_SKIP_VERIFY",
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub insecure_skip_verify: Option<bool>,

    /// PEM file with extra trusted root certificates
    #[arg(long, env = "SLIPSTREAM_CA_FILE")]
    pub ca_file: Option<PathBuf>,

    /// Admin HTTP address (/health, /metrics, /session, /conns); empty disables
    #[arg(long, env = "SLIPSTREAM_ADMIN_ADDR")]
    pub admin_addr: Option<String>,

    /// Log level: debug | info | warn | error [default: info]
    #[arg(long, env = "SLIPSTREAM_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log format: text | json [default: text]
    #[arg(long, env = "SLIPSTREAM_LOG_FORMAT")]
    pub log_format: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

/// Finds the config file, if any. An explicit path must exist; discovered
/// paths are only used when present.
pub fn resolve_config_path(
    explicit: Option<PathBuf>,
    cwd: &Path,
) -> anyhow::Result<Option<ResolvedConfigPath>> {
    if let Some(p) = explicit {
        if p.as_os_str().is_empty() {
            anyhow::bail!("config: empty config path");
        }
        let meta = fs::metadata(&p).with_context(|| format!("config: stat {}", p.display()))?;
        let path = if meta.is_dir() {
            discover_config_path(&p)?
        } else {
            p
        };
        return Ok(Some(ResolvedConfigPath {
            path,
            source: ConfigPathSource::Flag,
        }));
    }

    if let Ok(p) = discover_config_path(cwd) {
        return Ok(Some(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        }));
    }

    if let Some(p) = default_config_path() {
        if p.is_file() {
            return Ok(Some(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Default,
            }));
        }
    }

    Ok(None)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    let candidates = ["slipstream.toml", "slipstream.yaml", "slipstream.yml"];
    for c in candidates {
        let p = dir.join(c);
        if let Ok(m) = fs::metadata(&p) {
            if m.is_file() {
                return Ok(p);
            }
        }
    }
    anyhow::bail!("config: no slipstream.* found in {}", dir.display())
}

fn default_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Some(PathBuf::from("/etc/slipstream/slipstream.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("com", "slipstream", "slipstream")
            .map(|proj| proj.config_dir().join("slipstream.toml"))
    }
}

/// Runtime configuration. Built once at startup and never mutated.
#[derive(Debug, Clone)]
pub struct Config {
    pub resolver: SocketAddr,
    pub dns_timeout: Duration,
    pub domain: String,
    pub tcp_listen_port: u16,
    pub server_port: u16,
    pub keep_alive: Duration,
    pub idle_timeout: Duration,
    pub congestion: CongestionControl,
    pub gso: bool,
    pub tls: TlsConfig,
    pub dial_timeout: Duration,
    pub stream_wait_timeout: Duration,
    pub buffer_size: usize,
    pub reconnect: ReconnectConfig,
    pub admin_addr: String,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub server_name: String,
    pub insecure_skip_verify: bool,
    pub ca_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive dial failures before the domain is resolved again.
    pub reresolve_after: u32,
    /// Consecutive dial failures before giving up; 0 retries forever.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            reresolve_after: 3,
            max_attempts: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Config {
    pub fn listen_addr(&self) -> SocketAddr {
        net::local_listen_addr(self.tcp_listen_port)
    }

    pub fn dial_options(&self) -> QuicDialOptions {
        QuicDialOptions {
            server_name: self.tls.server_name.clone(),
            insecure_skip_verify: self.tls.insecure_skip_verify,
            ca_file: self.tls.ca_file.clone(),
            keep_alive: self.keep_alive,
            idle_timeout: self.idle_timeout,
            congestion: self.congestion,
            gso: self.gso,
            dial_timeout: self.dial_timeout,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    resolver: Option<String>,
    dns_timeout_ms: Option<u64>,
    domain: Option<String>,
    tcp_listen_port: Option<u16>,
    server_port: Option<u16>,
    keep_alive_interval_ms: Option<u64>,
    idle_timeout_ms: Option<u64>,
    congestion_control: Option<String>,
    gso: Option<bool>,
    dial_timeout_ms: Option<u64>,
    stream_wait_timeout_ms: Option<u64>,
    buffer_size: Option<usize>,
    admin_addr: Option<String>,
    tls: Option<FileTls>,
    reconnect: Option<FileReconnect>,
    logging: Option<FileLogging>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTls {
    server_name: Option<String>,
    insecure_skip_verify: Option<bool>,
    ca_file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileReconnect {
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    reresolve_after: Option<u32>,
    max_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

fn parse_file(path: &Path) -> anyhow::Result<FileConfig> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            ext
        ),
    };
    Ok(fc)
}

/// Builds the runtime config from flags and the optional file at `path`.
pub fn load_config(cli: &Cli, path: Option<&Path>) -> anyhow::Result<Config> {
    let fc = match path {
        Some(p) => parse_file(p)?,
        None => FileConfig::default(),
    };
    Config::from_sources(cli, fc)
}

fn non_empty(s: Option<&String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl Config {
    fn from_sources(cli: &Cli, fc: FileConfig) -> anyhow::Result<Config> {
        let tls = fc.tls.unwrap_or_default();
        let rc = fc.reconnect.unwrap_or_default();
        let lg = fc.logging.unwrap_or_default();

        let resolver_raw = non_empty(cli.resolver.as_ref())
            .or_else(|| non_empty(fc.resolver.as_ref()))
            .unwrap_or_else(|| DEFAULT_RESOLVER.to_string());
        let resolver = net::parse_resolver_addr(&resolver_raw).context("config: resolver")?;
        let dns_timeout = cli
            .dns_timeout
            .or(fc.dns_timeout_ms)
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_QUERY_TIMEOUT);

        let domain = non_empty(cli.domain.as_ref())
            .or_else(|| non_empty(fc.domain.as_ref()))
            .map(|d| d.trim_end_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .context("config: domain is required (--domain or SLIPSTREAM_DOMAIN)")?;

        let tcp_listen_port = cli
            .tcp_listen_port
            .or(fc.tcp_listen_port)
            .unwrap_or(DEFAULT_TCP_LISTEN_PORT);

        let server_port = cli
            .server_port
            .or(fc.server_port)
            .unwrap_or(TUNNEL_SERVER_PORT);
        if server_port == 0 {
            anyhow::bail!("config: server_port must not be 0");
        }

        let keep_alive = Duration::from_millis(
            cli.keep_alive_interval
                .or(fc.keep_alive_interval_ms)
                .unwrap_or(DEFAULT_KEEP_ALIVE_MS),
        );
        let idle_timeout = match cli.idle_timeout.or(fc.idle_timeout_ms) {
            Some(ms) if ms > 0 => Duration::from_millis(ms),
            _ if keep_alive > Duration::ZERO => keep_alive * 2,
            _ => Duration::from_secs(30),
        };
        if keep_alive > Duration::ZERO && idle_timeout <= keep_alive {
            anyhow::bail!(
                "config: idle timeout ({}) must be longer than the keep-alive interval ({})",
                humantime::format_duration(idle_timeout),
                humantime::format_duration(keep_alive)
            );
        }

        let congestion = match non_empty(cli.congestion_control.as_ref())
            .or_else(|| non_empty(fc.congestion_control.as_ref()))
        {
            Some(name) => name.parse::<CongestionControl>().context("config")?,
            None => CongestionControl::default(),
        };

        let server_name = non_empty(cli.server_name.as_ref())
            .or_else(|| non_empty(tls.server_name.as_ref()))
            .unwrap_or_else(|| domain.clone());

        let ca_file = cli
            .ca_file
            .clone()
            .or(tls.ca_file)
            .filter(|p| !p.as_os_str().is_empty());

        let mut logging = LoggingConfig {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: lg.add_source,
        };
        if let Some(level) = non_empty(cli.log_level.as_ref()).or_else(|| non_empty(lg.level.as_ref()))
        {
            logging.level = level;
        }
        if let Some(fmt) =
            non_empty(cli.log_format.as_ref()).or_else(|| non_empty(lg.format.as_ref()))
        {
            logging.format = fmt.to_ascii_lowercase();
        }
        if let Some(out) = non_empty(lg.output.as_ref()) {
            logging.output = out;
        }

        let defaults = ReconnectConfig::default();
        let initial_backoff = rc
            .initial_backoff_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.initial_backoff);
        let max_backoff = rc
            .max_backoff_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.max_backoff)
            .max(initial_backoff);

        Ok(Config {
            resolver,
            dns_timeout,
            domain,
            tcp_listen_port,
            server_port,
            keep_alive,
            idle_timeout,
            congestion,
            gso: cli.gso.or(fc.gso).unwrap_or(false),
            tls: TlsConfig {
                server_name,
                insecure_skip_verify: cli
                    .insecure_skip_verify
                    .or(tls.insecure_skip_verify)
                    .unwrap_or(false),
                ca_file,
            },
            dial_timeout: Duration::from_millis(
                fc.dial_timeout_ms.filter(|ms| *ms > 0).unwrap_or(10_000),
            ),
            stream_wait_timeout: Duration::from_millis(
                fc.stream_wait_timeout_ms.unwrap_or(5_000),
            ),
            buffer_size: fc.buffer_size.filter(|n| *n > 0).unwrap_or(32 * 1024),
            reconnect: ReconnectConfig {
                initial_backoff,
                max_backoff,
                reresolve_after: rc.reresolve_after.unwrap_or(defaults.reresolve_after),
                max_attempts: rc.max_attempts.unwrap_or(defaults.max_attempts),
            },
            admin_addr: non_empty(cli.admin_addr.as_ref())
                .or_else(|| non_empty(fc.admin_addr.as_ref()))
                .unwrap_or_default(),
            logging,
        })
    }
}
