//! Controller configuration

use std::path::PathBuf;
use std::time::Duration;

/// Settings consumed by the allocation coordinator
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Directory holding one subdirectory per VM
    pub vms_dir: PathBuf,

    /// Directory holding SSH keypairs (`<key_name>` / `<key_name>.pub`)
    pub ssh_dir: PathBuf,

    /// Public hostname clients connect to, used in the SSH hint
    pub public_host: String,

    /// Private IP pool: `<ip_base><suffix>` for suffixes in `ip_start..=ip_end`
    pub ip_base: String,
    pub ip_start: u32,
    pub ip_end: u32,

    /// Public tunnel port pool, inclusive
    pub port_start: u16,
    pub port_end: u16,

    /// Delay before a scheduled tunnel reload, letting the config write
    /// reach disk first
    pub reload_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            vms_dir: PathBuf::from(".vms"),
            ssh_dir: PathBuf::from(".ssh"),
            public_host: "127.0.0.1".to_string(),
            ip_base: "192.168.56.".to_string(),
            ip_start: 11,
            ip_end: 250,
            port_start: 2222,
            port_end: 2999,
            reload_delay: Duration::from_secs(1),
        }
    }
}
