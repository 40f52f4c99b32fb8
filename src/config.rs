use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::Parser;

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "Multi-tenant CONNECT tunnel gateway",
    long_about = "mthp accepts HTTP CONNECT tunnels and routes each authenticated username \
through its own configured upstream (direct, SOCKS5, or HTTP CONNECT proxy).\n\n\
Routing is changed at runtime via POST /upstream on the same listener; an update \
immediately severs the user's open tunnels so reconnection uses the new route."
)]
pub struct Cli {
    /// Port to listen on for both admin and tunnel traffic
    #[arg(short, long, default_value_t = 8090)]
    pub port: u16,

    /// IP address to bind the listener
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_ip: Ipv4Addr,

    /// Idle timeout in seconds for established tunnels
    #[arg(long, default_value_t = 540)]
    pub idle_timeout: u64,

    /// Basic realm announced in Proxy-Authenticate challenges
    #[arg(long, default_value = "proxy")]
    pub realm: String,
}

/// Gateway configuration derived from CLI arguments
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    pub idle_timeout: Duration,
    pub realm: String,
}

impl GatewayConfig {
    /// Create GatewayConfig from CLI arguments
    pub fn from_cli(args: Cli) -> Self {
        Self {
            listen_addr: SocketAddr::from((args.listen_ip, args.port)),
            idle_timeout: Duration::from_secs(args.idle_timeout),
            realm: args.realm,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["mthp"]);
        let config = GatewayConfig::from_cli(cli);

        assert_eq!(config.listen_addr.port(), 8090);
        assert_eq!(config.idle_timeout, Duration::from_secs(540));
        assert_eq!(config.realm, "proxy");
    }

    #[test]
    fn test_overrides() {
        let cli = Cli::parse_from([
            "mthp",
            "--port",
            "9999",
            "--listen-ip",
            "127.0.0.1",
            "--idle-timeout",
            "30",
            "--realm",
            "gw",
        ]);
        let config = GatewayConfig::from_cli(cli);

        assert_eq!(config.listen_addr.to_string(), "127.0.0.1:9999");
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.realm, "gw");
    }
}
