//! Tunnel client configuration reconciliation
//!
//! The config file is a fixed preamble (the server section) followed by zero
//! or more proxy blocks, each introduced by a literal `[[proxies]]` marker
//! line. The file is modeled as a parse/render pair; the marker itself is a
//! serialization detail confined to this module.
//!
//! Both operations are whole-file read-modify-write and rely on the
//! coordinator's resource lock for serialization.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::CoordinatorError;

/// Delimiter between the preamble and each proxy block
const PROXY_MARKER: &str = "\n[[proxies]]\n";

/// One forwarding rule to be rendered into the config file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEntry {
    pub name: String,
    pub local_ip: String,
    pub local_port: u16,
    pub remote_port: u16,
}

impl ProxyEntry {
    /// Deterministic block name for a VM's rule: `<vm-name>-<vm-local-port>`.
    pub fn block_name(vm_name: &str, vm_port: u16) -> String {
        format!("{vm_name}-{vm_port}")
    }

    fn render(&self) -> String {
        format!(
            "{PROXY_MARKER}name = \"{}\"\ntype = \"tcp\"\nlocalIP = \"{}\"\nlocalPort = {}\nremotePort = {}\n",
            self.name, self.local_ip, self.local_port, self.remote_port
        )
    }
}

/// A proxy block as parsed from the file: its name field plus the raw text
/// after the marker, kept verbatim so untouched blocks round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyBlock {
    pub name: String,
    pub body: String,
}

/// Structured view of the config file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub preamble: String,
    pub blocks: Vec<ProxyBlock>,
}

impl TunnelConfig {
    /// Parse file content into preamble and proxy blocks.
    ///
    /// A block without a recognizable `name = "<id>"` field fails with
    /// [`CoordinatorError::ConfigCorrupt`] rather than guessing a recovery.
    pub fn parse(content: &str) -> Result<Self, CoordinatorError> {
        let mut parts = content.split(PROXY_MARKER);
        let preamble = parts
            .next()
            .unwrap_or_default()
            .to_string();

        let mut blocks = Vec::new();
        for body in parts {
            let name = parse_block_name(body).ok_or_else(|| {
                CoordinatorError::ConfigCorrupt(
                    "proxy block without a name field".to_string(),
                )
            })?;
            blocks.push(ProxyBlock {
                name,
                body: body.to_string(),
            });
        }

        Ok(Self { preamble, blocks })
    }

    /// Render back to file content. The preamble and every surviving block
    /// are emitted verbatim, in order.
    pub fn render(&self) -> String {
        let mut out = self.preamble.clone();
        for block in &self.blocks {
            out.push_str(PROXY_MARKER);
            out.push_str(&block.body);
        }
        out
    }
}

fn parse_block_name(body: &str) -> Option<String> {
    body.lines().find_map(|line| {
        let rest = line.strip_prefix("name")?.trim_start().strip_prefix('=')?;
        let rest = rest.trim();
        rest.strip_prefix('"')?
            .strip_suffix('"')
            .map(str::to_string)
    })
}

/// Maintains the proxy section of the tunnel client's config file
pub struct ConfigReconciler {
    path: PathBuf,
}

impl ConfigReconciler {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append newly rendered proxy blocks to the end of the file.
    ///
    /// Duplicate names are a caller error; nothing is de-duplicated here.
    pub async fn append_proxies(&self, entries: &[ProxyEntry]) -> Result<(), CoordinatorError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut rendered = String::new();
        for entry in entries {
            rendered.push_str(&entry.render());
        }

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(rendered.as_bytes()).await?;
        file.flush().await?;

        debug!(count = entries.len(), "appended proxy blocks");
        Ok(())
    }

    /// Remove every proxy block whose name is in the given set, preserving
    /// the preamble byte-for-byte and the order of surviving blocks.
    ///
    /// Names with no matching block are ignored, which makes retrying a
    /// partially applied removal safe.
    pub async fn remove_proxies(&self, names: &HashSet<String>) -> Result<(), CoordinatorError> {
        if names.is_empty() {
            return Ok(());
        }

        let content = tokio::fs::read_to_string(&self.path).await?;
        let mut config = TunnelConfig::parse(&content)?;

        let before = config.blocks.len();
        config.blocks.retain(|block| !names.contains(&block.name));
        let removed = before - config.blocks.len();

        tokio::fs::write(&self.path, config.render()).await?;

        debug!(removed, "removed proxy blocks");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PREAMBLE: &str = "serverAddr = \"relay.example.com\"\nserverPort = 7000\n\n[admin]\naddr = \"127.0.0.1\"\nport = 7400\n";

    fn entry(name: &str, local_port: u16, remote_port: u16) -> ProxyEntry {
        ProxyEntry {
            name: name.to_string(),
            local_ip: "192.168.56.11".to_string(),
            local_port,
            remote_port,
        }
    }

    async fn setup(dir: &TempDir) -> ConfigReconciler {
        let path = dir.path().join("tunnel.toml");
        tokio::fs::write(&path, PREAMBLE).await.unwrap();
        ConfigReconciler::new(path)
    }

    #[tokio::test]
    async fn append_then_parse_round_trips() {
        let dir = TempDir::new().unwrap();
        let reconciler = setup(&dir).await;

        reconciler
            .append_proxies(&[entry("alpha-22", 22, 2222), entry("alpha-80", 80, 2223)])
            .await
            .unwrap();

        let content = tokio::fs::read_to_string(reconciler.path()).await.unwrap();
        let config = TunnelConfig::parse(&content).unwrap();

        assert_eq!(config.preamble, PREAMBLE);
        assert_eq!(config.blocks.len(), 2);
        assert_eq!(config.blocks[0].name, "alpha-22");
        assert_eq!(config.blocks[1].name, "alpha-80");
        assert_eq!(config.render(), content);
    }

    #[tokio::test]
    async fn remove_preserves_preamble_and_order() {
        let dir = TempDir::new().unwrap();
        let reconciler = setup(&dir).await;

        reconciler
            .append_proxies(&[
                entry("alpha-22", 22, 2222),
                entry("beta-22", 22, 2223),
                entry("gamma-22", 22, 2224),
            ])
            .await
            .unwrap();

        reconciler
            .remove_proxies(&HashSet::from(["beta-22".to_string()]))
            .await
            .unwrap();

        let content = tokio::fs::read_to_string(reconciler.path()).await.unwrap();
        let config = TunnelConfig::parse(&content).unwrap();

        assert_eq!(config.preamble, PREAMBLE);
        let names: Vec<_> = config.blocks.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["alpha-22", "gamma-22"]);
    }

    #[tokio::test]
    async fn remove_then_re_add_leaves_exactly_one_block() {
        let dir = TempDir::new().unwrap();
        let reconciler = setup(&dir).await;

        reconciler
            .append_proxies(&[entry("alpha-22", 22, 2222)])
            .await
            .unwrap();
        reconciler
            .remove_proxies(&HashSet::from(["alpha-22".to_string()]))
            .await
            .unwrap();
        reconciler
            .append_proxies(&[entry("alpha-22", 22, 2225)])
            .await
            .unwrap();

        let content = tokio::fs::read_to_string(reconciler.path()).await.unwrap();
        let config = TunnelConfig::parse(&content).unwrap();

        let matching: Vec<_> = config
            .blocks
            .iter()
            .filter(|b| b.name == "alpha-22")
            .collect();
        assert_eq!(matching.len(), 1);
        assert!(matching[0].body.contains("remotePort = 2225"));
    }

    #[tokio::test]
    async fn removing_unknown_name_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let reconciler = setup(&dir).await;

        reconciler
            .append_proxies(&[entry("alpha-22", 22, 2222)])
            .await
            .unwrap();

        let before = tokio::fs::read_to_string(reconciler.path()).await.unwrap();
        reconciler
            .remove_proxies(&HashSet::from(["nope-99".to_string()]))
            .await
            .unwrap();
        let after = tokio::fs::read_to_string(reconciler.path()).await.unwrap();

        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn block_without_name_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let reconciler = setup(&dir).await;

        let path = reconciler.path().to_path_buf();
        let mut content = tokio::fs::read_to_string(&path).await.unwrap();
        content.push_str("\n[[proxies]]\ntype = \"tcp\"\nlocalPort = 22\n");
        tokio::fs::write(&path, content).await.unwrap();

        let result = reconciler
            .remove_proxies(&HashSet::from(["alpha-22".to_string()]))
            .await;
        assert!(matches!(result, Err(CoordinatorError::ConfigCorrupt(_))));
    }

    #[test]
    fn empty_file_parses_to_empty_preamble() {
        let config = TunnelConfig::parse("").unwrap();
        assert_eq!(config.preamble, "");
        assert!(config.blocks.is_empty());
    }
}
