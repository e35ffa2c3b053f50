//! WireGuard tunnel configuration parser
//!
//! The controller sends the tunnel configuration as the text of a standard
//! WireGuard `.conf` file (`[Interface]` and `[Peer]` sections). This module
//! turns that text into a validated [`TunnelConfig`].

use std::net::{IpAddr, SocketAddr};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ipnet::IpNet;

use crate::crypto::x25519::{self, KEY_LEN};
use crate::error::ConfigError;

/// Complete tunnel configuration
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Interface configuration (our side)
    pub interface: InterfaceConfig,
    /// Peer configurations
    pub peers: Vec<PeerConfig>,
}

/// Interface (local) configuration
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    /// Our private key
    pub private_key: [u8; KEY_LEN],
    /// Tunnel addresses with prefix (IPv4 and IPv6)
    pub address: Vec<IpNet>,
    /// DNS servers
    pub dns: Vec<IpAddr>,
    pub listen_port: Option<u16>,
    /// MTU (defaults to 1420 when applied)
    pub mtu: Option<u16>,
}

/// Peer configuration
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub public_key: [u8; KEY_LEN],
    pub preshared_key: Option<[u8; KEY_LEN]>,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<IpNet>,
    /// Keepalive interval in seconds
    pub persistent_keepalive: Option<u16>,
}

/// Default interface MTU
pub const DEFAULT_MTU: u16 = 1420;

impl TunnelConfig {
    /// Parse a tunnel configuration from `.conf` text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut interface: Option<InterfaceBuilder> = None;
        let mut peers: Vec<PeerConfig> = Vec::new();
        let mut current_peer: Option<PeerBuilder> = None;
        let mut section: Option<Section> = None;

        for (index, raw) in content.lines().enumerate() {
            let line_num = index + 1;
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }

            if let Some(next) = Section::from_header(line) {
                if let Some(peer) = current_peer.take() {
                    peers.push(peer.build()?);
                }
                match next {
                    Section::Interface => {
                        if interface.is_some() {
                            return Err(ConfigError::ParseError {
                                line: line_num,
                                message: "Duplicate [Interface] section".to_string(),
                            });
                        }
                        interface = Some(InterfaceBuilder::default());
                    }
                    Section::Peer => current_peer = Some(PeerBuilder::default()),
                }
                section = Some(next);
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("Expected 'key = value', got: {}", line),
                });
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            match (section, interface.as_mut(), current_peer.as_mut()) {
                (Some(Section::Interface), Some(iface), _) => {
                    iface.apply(&key, value, line_num)?
                }
                (Some(Section::Peer), _, Some(peer)) => peer.apply(&key, value, line_num)?,
                _ => {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: "Configuration value outside of any section".to_string(),
                    });
                }
            }
        }

        if let Some(peer) = current_peer.take() {
            peers.push(peer.build()?);
        }

        let interface = interface
            .ok_or(ConfigError::MissingField {
                field: "[Interface] section".to_string(),
            })?
            .build()?;

        Ok(TunnelConfig { interface, peers })
    }

    /// Our public key derived from the private key
    pub fn public_key(&self) -> [u8; KEY_LEN] {
        x25519::public_key(&self.interface.private_key)
    }

    /// Base64 form of our public key, as shown by `wg show`
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.public_key())
    }

    /// First tunnel address, without prefix
    pub fn vpn_ip(&self) -> Option<String> {
        self.interface.address.first().map(|net| net.addr().to_string())
    }

    /// Endpoint of the first peer that has one
    pub fn server_endpoint(&self) -> Option<SocketAddr> {
        self.peers.iter().find_map(|peer| peer.endpoint)
    }

    pub fn mtu(&self) -> u16 {
        self.interface.mtu.unwrap_or(DEFAULT_MTU)
    }
}

#[derive(Clone, Copy)]
enum Section {
    Interface,
    Peer,
}

impl Section {
    fn from_header(line: &str) -> Option<Self> {
        if line.eq_ignore_ascii_case("[interface]") {
            Some(Self::Interface)
        } else if line.eq_ignore_ascii_case("[peer]") {
            Some(Self::Peer)
        } else {
            None
        }
    }
}

#[derive(Default)]
struct InterfaceBuilder {
    private_key: Option<[u8; KEY_LEN]>,
    address: Vec<IpNet>,
    dns: Vec<IpAddr>,
    listen_port: Option<u16>,
    mtu: Option<u16>,
}

impl InterfaceBuilder {
    fn apply(&mut self, key: &str, value: &str, line: usize) -> Result<(), ConfigError> {
        match key {
            "privatekey" => self.private_key = Some(parse_key(value, "PrivateKey")?),
            "address" => self.address.extend(parse_cidr_list(value)?),
            "dns" => {
                for item in split_list(value) {
                    // wg-quick allows search domains here; only addresses matter to us
                    match item.parse::<IpAddr>() {
                        Ok(addr) => self.dns.push(addr),
                        Err(_) => tracing::debug!("Ignoring DNS search domain: {}", item),
                    }
                }
            }
            "listenport" => self.listen_port = Some(parse_number(value, "ListenPort", line)?),
            "mtu" => self.mtu = Some(parse_number(value, "MTU", line)?),
            _ => tracing::debug!("Unknown interface key: {}", key),
        }
        Ok(())
    }

    fn build(self) -> Result<InterfaceConfig, ConfigError> {
        let private_key = self.private_key.ok_or(ConfigError::MissingField {
            field: "PrivateKey".to_string(),
        })?;
        if self.address.is_empty() {
            return Err(ConfigError::MissingField {
                field: "Address".to_string(),
            });
        }
        Ok(InterfaceConfig {
            private_key,
            address: self.address,
            dns: self.dns,
            listen_port: self.listen_port,
            mtu: self.mtu,
        })
    }
}

#[derive(Default)]
struct PeerBuilder {
    public_key: Option<[u8; KEY_LEN]>,
    preshared_key: Option<[u8; KEY_LEN]>,
    endpoint: Option<SocketAddr>,
    allowed_ips: Vec<IpNet>,
    persistent_keepalive: Option<u16>,
}

impl PeerBuilder {
    fn apply(&mut self, key: &str, value: &str, line: usize) -> Result<(), ConfigError> {
        match key {
            "publickey" => self.public_key = Some(parse_key(value, "PublicKey")?),
            "presharedkey" => self.preshared_key = Some(parse_key(value, "PresharedKey")?),
            "endpoint" => {
                self.endpoint = Some(value.parse().map_err(|_| ConfigError::InvalidAddress {
                    value: value.to_string(),
                })?)
            }
            "allowedips" => self.allowed_ips.extend(parse_cidr_list(value)?),
            "persistentkeepalive" => {
                self.persistent_keepalive = Some(parse_number(value, "PersistentKeepalive", line)?)
            }
            _ => tracing::debug!("Unknown peer key: {}", key),
        }
        Ok(())
    }

    fn build(self) -> Result<PeerConfig, ConfigError> {
        let public_key = self.public_key.ok_or(ConfigError::MissingField {
            field: "PublicKey in [Peer]".to_string(),
        })?;
        if !x25519::is_valid_public_key(&public_key) {
            return Err(ConfigError::InvalidKey {
                field: "PublicKey".to_string(),
            });
        }

        Ok(PeerConfig {
            public_key,
            preshared_key: self.preshared_key,
            endpoint: self.endpoint,
            allowed_ips: self.allowed_ips,
            persistent_keepalive: self.persistent_keepalive,
        })
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_cidr_list(value: &str) -> Result<Vec<IpNet>, ConfigError> {
    split_list(value)
        .map(|item| {
            item.parse::<IpNet>().map_err(|_| ConfigError::InvalidCidr {
                value: item.to_string(),
            })
        })
        .collect()
}

fn parse_number<T: std::str::FromStr>(
    value: &str,
    field: &str,
    line: usize,
) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::ParseError {
        line,
        message: format!("Invalid {}: {}", field, value),
    })
}

/// Parse a base64-encoded 32-byte key
fn parse_key(value: &str, field_name: &str) -> Result<[u8; KEY_LEN], ConfigError> {
    let bytes = BASE64.decode(value).map_err(|_| ConfigError::InvalidKey {
        field: field_name.to_string(),
    })?;

    bytes.try_into().map_err(|_| ConfigError::InvalidKey {
        field: field_name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CONFIG: &str = "[Interface]\r\n\
PrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=\r\n\
Address = 10.53.0.14/32\r\n\
DNS = 8.8.8.8\r\n\
\r\n\
[Peer]\r\n\
PublicKey = YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=\r\n\
Endpoint = 67.219.108.79:51820\r\n\
AllowedIPs = 0.0.0.0/0, ::/0\r\n\
PersistentKeepalive = 25";

    #[test]
    fn test_parse_config() {
        let config = TunnelConfig::parse(TEST_CONFIG).unwrap();

        assert_eq!(config.interface.address.len(), 1);
        assert_eq!(config.interface.address[0].to_string(), "10.53.0.14/32");
        assert_eq!(config.interface.dns[0].to_string(), "8.8.8.8");
        assert_eq!(config.mtu(), DEFAULT_MTU);

        assert_eq!(config.peers.len(), 1);
        let peer = &config.peers[0];
        assert_eq!(peer.endpoint.unwrap().to_string(), "67.219.108.79:51820");
        assert_eq!(peer.persistent_keepalive, Some(25));
        // Both the IPv4 and the IPv6 default route
        assert_eq!(peer.allowed_ips.len(), 2);

        assert_eq!(config.vpn_ip().as_deref(), Some("10.53.0.14"));
        assert_eq!(
            config.server_endpoint().map(|e| e.to_string()).as_deref(),
            Some("67.219.108.79:51820")
        );
    }

    #[test]
    fn test_public_key_derivation() {
        let config = TunnelConfig::parse(TEST_CONFIG).unwrap();
        let encoded = config.public_key_base64();
        assert_eq!(encoded.len(), 44);
        assert_ne!(config.public_key(), config.interface.private_key);
    }

    #[test]
    fn test_comments_and_mtu() {
        let text = "# managed by controller\n[Interface]\nPrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w= # ours\nAddress = 10.0.0.2/24, fd00::2/64\nMTU = 1280\n";
        let config = TunnelConfig::parse(text).unwrap();
        assert_eq!(config.interface.address.len(), 2);
        assert_eq!(config.mtu(), 1280);
        assert!(config.peers.is_empty());
    }

    #[test]
    fn test_invalid_key() {
        assert!(parse_key("invalid-base64!", "TestKey").is_err());
        // "too short" in base64
        assert!(parse_key("dG9vIHNob3J0", "TestKey").is_err());
    }

    #[test]
    fn test_missing_interface() {
        let text = "[Peer]\nPublicKey = YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=\n";
        assert!(matches!(
            TunnelConfig::parse(text),
            Err(ConfigError::MissingField { .. })
        ));
    }

    #[test]
    fn test_missing_private_key() {
        let text = "[Interface]\nAddress = 10.0.0.2/24\n";
        assert!(TunnelConfig::parse(text).is_err());
    }

    #[test]
    fn test_value_outside_section() {
        let text = "PrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=\n";
        assert!(matches!(
            TunnelConfig::parse(text),
            Err(ConfigError::ParseError { line: 1, .. })
        ));
    }

    #[test]
    fn test_bad_endpoint() {
        let text = "[Interface]\nPrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=\nAddress = 10.0.0.2/32\n[Peer]\nPublicKey = YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=\nEndpoint = not-an-endpoint\n";
        assert!(matches!(
            TunnelConfig::parse(text),
            Err(ConfigError::InvalidAddress { .. })
        ));
    }
}
