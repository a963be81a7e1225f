//! CLI configuration, following the teacher's clap-derive + env-var
//! fallback pattern: every flag has a matching environment variable so the
//! binary is configurable identically from a shell or a container's env.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;

use crate::identity::DEFAULT_GATEWAY_IPS;

fn default_bind_addr() -> String {
    std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:9100".to_owned())
}

fn default_log_path() -> String {
    std::env::var("TELEMETRY_LOG_PATH").unwrap_or_else(|_| "./telemetry.jsonl".to_owned())
}

fn default_log_level() -> String {
    std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned())
}

#[derive(Debug, Parser)]
#[command(name = "telemetry-server", about = "Real-time telemetry aggregator and broadcast server")]
pub struct Cli {
    /// Path to the append-only OTEL-shaped telemetry log to tail.
    #[arg(long, default_value_t = default_log_path())]
    pub log_path: String,

    /// Address the WebSocket server binds to.
    #[arg(long, default_value_t = default_bind_addr())]
    pub bind_addr: String,

    /// Path to the persistent peer-name map (created if absent).
    #[arg(long, default_value = "./peer_names.json")]
    pub name_map_path: PathBuf,

    /// Additional gateway IPs, beyond the built-in default, treated as the
    /// network's known entry point for display purposes.
    #[arg(long)]
    pub gateway_ip: Vec<Ipv4Addr>,

    /// HTTP endpoint of an external name-moderation service. When absent,
    /// peer names are validated locally instead.
    #[arg(long)]
    pub moderator_endpoint: Option<String>,

    /// `tracing_subscriber::EnvFilter` directive, e.g. `debug` or
    /// `telemetry_server=debug,tower_http=info`.
    #[arg(long, default_value_t = default_log_level())]
    pub log_level: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_path: PathBuf,
    pub bind_addr: SocketAddr,
    pub name_map_path: PathBuf,
    pub gateway_ips: Vec<Ipv4Addr>,
    pub moderator_endpoint: Option<String>,
}

impl TryFrom<Cli> for Config {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let bind_addr = cli
            .bind_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid bind address {:?}: {e}", cli.bind_addr))?;

        let mut gateway_ips: Vec<Ipv4Addr> = DEFAULT_GATEWAY_IPS
            .iter()
            .map(|s| s.parse().expect("built-in gateway IP is valid"))
            .collect();
        gateway_ips.extend(cli.gateway_ip);

        Ok(Config {
            log_path: PathBuf::from(cli.log_path),
            bind_addr,
            name_map_path: cli.name_map_path,
            gateway_ips,
            moderator_endpoint: cli.moderator_endpoint,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_gateway_always_includes_the_builtin_entry() {
        let cli = Cli {
            log_path: "x.jsonl".to_owned(),
            bind_addr: "127.0.0.1:9100".to_owned(),
            name_map_path: PathBuf::from("names.json"),
            gateway_ip: vec![],
            moderator_endpoint: None,
            log_level: "info".to_owned(),
        };
        let config = Config::try_from(cli).unwrap();
        assert!(config.gateway_ips.contains(&"5.9.111.215".parse().unwrap()));
    }

    #[test]
    fn invalid_bind_address_is_rejected() {
        let cli = Cli {
            log_path: "x.jsonl".to_owned(),
            bind_addr: "not-an-address".to_owned(),
            name_map_path: PathBuf::from("names.json"),
            gateway_ip: vec![],
            moderator_endpoint: None,
            log_level: "info".to_owned(),
        };
        assert!(Config::try_from(cli).is_err());
    }
}
