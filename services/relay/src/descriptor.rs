//! Client-facing connection descriptor.
//!
//! The descriptor is a base64-encoded share link built from the public
//! domain, public port and relay mode. The link format belongs to the
//! backend's client ecosystem; we only fill in the pieces we know.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::{Config, Mode};

/// Placeholder host used until a public domain is known.
pub const PENDING_DOMAIN: &str = "pending";

const QUICK_TUNNEL_SUFFIX: &str = ".trycloudflare.com";

/// Builds descriptors from static config plus the current public domain.
#[derive(Clone)]
pub struct DescriptorBuilder {
    client_id: Uuid,
    public_port: u16,
    mode: Mode,
    tunnel_path: Option<String>,
    domain: watch::Receiver<Option<String>>,
}

impl DescriptorBuilder {
    pub fn new(config: &Config, domain: watch::Receiver<Option<String>>) -> Self {
        Self {
            client_id: config.client_id,
            public_port: config.public_port,
            mode: config.mode,
            tunnel_path: config.tunnel_path.clone(),
            domain,
        }
    }

    /// Current public domain, or [`PENDING_DOMAIN`].
    pub fn domain(&self) -> String {
        self.domain
            .borrow()
            .clone()
            .unwrap_or_else(|| PENDING_DOMAIN.to_string())
    }

    /// Plain (not yet encoded) share link.
    pub fn link(&self) -> String {
        let domain = self.domain();
        let transport = match self.mode {
            Mode::Tcp => "type=tcp&flow=xtls-rprx-vision".to_string(),
            Mode::Upgrade => format!(
                "type=ws&host={domain}&path={}",
                self.tunnel_path.as_deref().unwrap_or("/")
            ),
            Mode::Stream => format!(
                "type=xhttp&host={domain}&path={}",
                self.tunnel_path.as_deref().unwrap_or("/")
            ),
        };
        format!(
            "vless://{}@{domain}:{}?encryption=none&security=tls&sni={domain}&fp=chrome&{transport}#relay",
            self.client_id, self.public_port
        )
    }

    /// Base64-encoded descriptor, as served to clients.
    pub fn encoded(&self) -> String {
        STANDARD.encode(self.link())
    }
}

/// Extract a quick-tunnel hostname (`<name>.trycloudflare.com`) from a log line.
pub fn extract_quick_tunnel_domain(line: &str) -> Option<String> {
    let start = line.find("https://")? + "https://".len();
    let rest = &line[start..];
    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '.'))
        .unwrap_or(rest.len());
    let host = rest[..end].trim_end_matches('.');

    let label = host.strip_suffix(QUICK_TUNNEL_SUFFIX)?;
    if label.is_empty() || label.contains('.') {
        return None;
    }
    Some(host.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(mode: Mode) -> Config {
        let mut config = Config::from_lookup(|_| None).unwrap();
        config.mode = mode;
        config
    }

    #[test]
    fn test_pending_domain() {
        let (_tx, rx) = watch::channel(None);
        let builder = DescriptorBuilder::new(&test_config(Mode::Tcp), rx);
        assert_eq!(builder.domain(), PENDING_DOMAIN);
        assert!(builder.link().contains("@pending:443?"));
    }

    #[test]
    fn test_link_follows_domain_and_mode() {
        let (tx, rx) = watch::channel(None);
        let builder = DescriptorBuilder::new(&test_config(Mode::Upgrade), rx);
        tx.send_replace(Some("edge.example.com".to_string()));

        let link = builder.link();
        assert!(link.starts_with("vless://9afd1229-b893-40c1-84dd-51e7ce204913@edge.example.com:443?"));
        assert!(link.contains("type=ws&host=edge.example.com&path=/speed"));

        let decoded = STANDARD.decode(builder.encoded()).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), link);
    }

    #[test]
    fn test_extract_quick_tunnel_domain() {
        assert_eq!(
            extract_quick_tunnel_domain("2024 INF |  https://Calm-Sea-12.trycloudflare.com   |"),
            Some("calm-sea-12.trycloudflare.com".to_string())
        );
        assert_eq!(
            extract_quick_tunnel_domain("visit https://example.com for docs"),
            None
        );
        assert_eq!(
            extract_quick_tunnel_domain("https://a.b.trycloudflare.com"),
            None
        );
        assert_eq!(extract_quick_tunnel_domain("no link here"), None);
    }
}
