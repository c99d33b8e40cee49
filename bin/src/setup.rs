//! The setup wizard: write a commented example bootstrap file for the
//! operator to edit.
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::info;

const EXAMPLE: &str = r#"# haven bootstrap configuration
#
# Only node identity lives here; everything else (subnets, pools,
# reservations, DNS, blocklists, rules) is dynamic configuration managed
# through the API and replicated between HA peers.

[server]
# interface to serve on; the first up ipv4 interface when unset
interface = "eth0"
bind_address = "0.0.0.0:67"
# our address on the serving interface (DHCP option 54)
server_id = "192.168.1.1"
lease_db = "/var/lib/haven/leases.redb"
# pid_file = "/run/haven.pid"
node_name = "haven-a"

[ha]
enabled = false
# role = "primary"            # or "secondary"
# listen_address = "0.0.0.0:6543"   # primary side
# peer_address = "haven-b.lan:6543" # secondary side
# peer_url = "https://haven-a.lan:8443"
# auth_token = "change-me"
# heartbeat_interval_secs = 1
# failover_timeout_secs = 10

# [ha.tls]
# cert = "/etc/haven/tls/node.crt"
# key = "/etc/haven/tls/node.key"
# ca = "/etc/haven/tls/ca.crt"
"#;

pub fn write_example(path: &Path) -> Result<()> {
    if path.exists() {
        bail!(
            "{} already exists, refusing to overwrite",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(path, EXAMPLE).with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), "wrote example bootstrap config, edit it and start again");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dynconfig::Bootstrap;
    use tempfile::TempDir;

    #[test]
    fn example_parses() {
        Bootstrap::parse(EXAMPLE).unwrap();
    }

    #[test]
    fn refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("haven.toml");
        write_example(&path).unwrap();
        assert!(write_example(&path).is_err());
    }
}
