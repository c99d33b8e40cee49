//! Bootstrap configuration.
//!
//! Server identity and HA node identity live in an external TOML file,
//! not in the replicated config store: two nodes must never exchange
//! their own identities. The file is only ever modified through the
//! section-surgical editor, which replaces the `[ha]` block in place,
//! writes a timestamped backup and renames atomically.
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use haven_core::error::{Error, Result};

/// Configured role of this node. Fixed for the process lifetime; only
/// the runtime state (active/standby) moves during failover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Primary,
    Secondary,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Primary => f.write_str("primary"),
            NodeRole::Secondary => f.write_str("secondary"),
        }
    }
}

/// TLS material for the peer link. Client-certificate auth: both sides
/// present a certificate signed by `ca`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsIdentity {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
    /// name the dialing side verifies; defaults to the peer host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

/// HA node identity. Never replicated between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaIdentity {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_role")]
    pub role: NodeRole,
    /// where we accept the peer connection (primary side)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_address: Option<SocketAddr>,
    /// where we dial the peer (secondary side)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_address: Option<String>,
    /// the peer's admin URL, returned with standby-write rejections
    #[serde(default)]
    pub peer_url: String,
    /// shared secret presented in the hello frame
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_failover")]
    pub failover_timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsIdentity>,
}

fn default_role() -> NodeRole {
    NodeRole::Primary
}
fn default_heartbeat() -> u64 {
    1
}
fn default_failover() -> u64 {
    10
}

impl Default for HaIdentity {
    fn default() -> Self {
        Self {
            enabled: false,
            role: NodeRole::Primary,
            listen_address: None,
            peer_address: None,
            peer_url: String::new(),
            auth_token: None,
            heartbeat_interval_secs: 1,
            failover_timeout_secs: 10,
            tls: None,
        }
    }
}

/// Server identity: which wire we serve and where state lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerIdentity {
    /// interface to bind; first up ipv4 interface when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(default = "default_bind")]
    pub bind_address: SocketAddr,
    /// our server identifier (option 54)
    pub server_id: Ipv4Addr,
    #[serde(default = "default_db_path")]
    pub lease_db: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid_file: Option<PathBuf>,
    /// node name used in events and logs
    #[serde(default)]
    pub node_name: String,
}

fn default_bind() -> SocketAddr {
    "0.0.0.0:67".parse().unwrap()
}
fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/haven/leases.redb")
}

/// The whole bootstrap file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bootstrap {
    pub server: ServerIdentity,
    #[serde(default)]
    pub ha: HaIdentity,
}

impl Bootstrap {
    pub fn parse(input: &str) -> Result<Self> {
        toml::from_str(input).map_err(|e| Error::validation(format!("bootstrap config: {e}")))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::validation(format!("reading bootstrap config: {e}")))?;
        Self::parse(&content)
    }

    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.ha.heartbeat_interval_secs.max(1))
    }

    pub fn failover_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.ha.failover_timeout_secs.max(1))
    }
}

#[derive(Serialize)]
struct HaDoc<'a> {
    ha: &'a HaIdentity,
}

/// Replace the `[ha]` block of the bootstrap file in place. The rest of
/// the file is preserved byte-for-byte. A `.bak.<timestamp>` sibling is
/// written before the atomic rename.
pub fn replace_ha_section(path: impl AsRef<Path>, ha: &HaIdentity) -> Result<()> {
    let path = path.as_ref();
    let original = std::fs::read_to_string(path)
        .map_err(|e| Error::validation(format!("reading bootstrap config: {e}")))?;

    let block = toml::to_string(&HaDoc { ha })
        .map_err(|e| Error::validation(format!("encoding ha section: {e}")))?;

    let updated = splice_ha_block(&original, &block);
    // re-parse to guarantee we never write a broken file
    Bootstrap::parse(&updated)?;

    let backup = path.with_extension(format!(
        "toml.bak.{}",
        chrono::Utc::now().timestamp()
    ));
    std::fs::copy(path, &backup)
        .map_err(|e| Error::validation(format!("writing backup {}: {e}", backup.display())))?;

    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, &updated)
        .map_err(|e| Error::validation(format!("writing {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| Error::validation(format!("replacing {}: {e}", path.display())))?;
    info!(path = %path.display(), backup = %backup.display(), "rewrote [ha] section");
    Ok(())
}

/// Splice a freshly-encoded `[ha]` block over the existing one. Tables
/// nested under `[ha.*]` belong to the block and are replaced with it.
fn splice_ha_block(original: &str, block: &str) -> String {
    let lines: Vec<&str> = original.lines().collect();
    let is_ha_header = |l: &str| {
        let t = l.trim_start();
        t == "[ha]" || t.starts_with("[ha.")
    };
    let is_other_header = |l: &str| {
        let t = l.trim_start();
        t.starts_with('[') && !is_ha_header(l) && !t.starts_with("[[ha")
    };

    let Some(start) = lines.iter().position(|l| l.trim_start() == "[ha]") else {
        // no existing block: append
        let mut out = original.to_string();
        if !out.ends_with('\n') {
            out.push('\n');
        }
        out.push('\n');
        out.push_str(block);
        return out;
    };
    let end = lines[start + 1..]
        .iter()
        .position(|l| is_other_header(*l))
        .map(|i| start + 1 + i)
        .unwrap_or(lines.len());

    let mut out = String::new();
    for l in &lines[..start] {
        out.push_str(l);
        out.push('\n');
    }
    out.push_str(block);
    if !block.ends_with('\n') {
        out.push('\n');
    }
    for l in &lines[end..] {
        out.push_str(l);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"# node bootstrap
[server]
interface = "eth0"
bind_address = "0.0.0.0:67"
server_id = "192.168.1.1"
lease_db = "/tmp/haven/leases.redb"
node_name = "node-a"

[ha]
enabled = true
role = "primary"
listen_address = "0.0.0.0:6543"
peer_url = "https://node-b.lan:8443"
heartbeat_interval_secs = 1
failover_timeout_secs = 10
"#;

    #[test]
    fn parse_sample() {
        let boot = Bootstrap::parse(SAMPLE).unwrap();
        assert_eq!(boot.server.interface.as_deref(), Some("eth0"));
        assert_eq!(boot.ha.role, NodeRole::Primary);
        assert!(boot.ha.enabled);
        assert_eq!(boot.failover_timeout(), std::time::Duration::from_secs(10));
    }

    #[test]
    fn surgical_edit_preserves_other_sections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("haven.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let mut ha = Bootstrap::parse(SAMPLE).unwrap().ha;
        ha.role = NodeRole::Secondary;
        ha.peer_address = Some("node-a.lan:6543".into());
        replace_ha_section(&path, &ha).unwrap();

        let updated = Bootstrap::load(&path).unwrap();
        assert_eq!(updated.ha.role, NodeRole::Secondary);
        assert_eq!(updated.ha.peer_address.as_deref(), Some("node-a.lan:6543"));
        // server identity untouched
        assert_eq!(updated.server.node_name, "node-a");

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("# node bootstrap"));

        // a backup sibling exists
        let backups: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".bak."))
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[test]
    fn splice_appends_when_block_missing() {
        let no_ha = "[server]\nserver_id = \"10.0.0.1\"\n";
        let ha = HaIdentity::default();
        let block = toml::to_string(&HaDoc { ha: &ha }).unwrap();
        let spliced = splice_ha_block(no_ha, &block);
        let boot = Bootstrap::parse(&spliced).unwrap();
        assert!(!boot.ha.enabled);
    }

    #[test]
    fn splice_replaces_nested_tls_table() {
        let with_tls = format!(
            "{SAMPLE}\n[ha.tls]\ncert = \"/a\"\nkey = \"/b\"\nca = \"/c\"\n\n[extra]\nx = 1\n"
        );
        let ha = HaIdentity::default();
        let block = toml::to_string(&HaDoc { ha: &ha }).unwrap();
        let spliced = splice_ha_block(&with_tls, &block);
        assert!(!spliced.contains("[ha.tls]"));
        assert!(spliced.contains("[extra]"));
    }
}
