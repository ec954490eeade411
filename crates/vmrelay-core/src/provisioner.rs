//! VM provisioning backend
//!
//! Invokes the provisioning tool (`vagrant`) in a per-VM working directory
//! containing a generated declarative definition file. Child output is
//! streamed into tracing; only the exit code decides success. Runs are
//! bounded by a configurable ceiling with a forced kill on expiry.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::CoordinatorError;

/// Parameters of a VM as handed to the definition renderer
#[derive(Debug, Clone)]
pub struct VmDefinition {
    pub name: String,
    pub image: String,
    pub ram: i32,
    pub cpu: i32,
    pub private_ip: String,
    pub public_key_path: PathBuf,
    /// Optional user-supplied shell script, run once after base provisioning
    pub provisioning_script: Option<String>,
}

/// Provisioning seam between the coordinator and the external tool
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Boot (and on first run, provision) the VM in `vm_dir`.
    async fn up(&self, vm_dir: &Path) -> Result<(), CoordinatorError>;

    /// Halt the VM in `vm_dir`.
    async fn halt(&self, vm_dir: &Path) -> Result<(), CoordinatorError>;

    /// Destroy the VM in `vm_dir` and remove the directory.
    async fn destroy(&self, vm_dir: &Path) -> Result<(), CoordinatorError>;
}

/// Production provisioner shelling out to vagrant
pub struct VagrantProvisioner {
    command: String,
    /// Ceiling on a single tool run; `None` means unbounded
    timeout: Option<Duration>,
}

impl VagrantProvisioner {
    pub fn new() -> Self {
        Self {
            command: "vagrant".to_string(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn run(&self, vm_dir: &Path, args: &[&str]) -> Result<(), CoordinatorError> {
        info!(dir = %vm_dir.display(), ?args, "running provisioning tool");

        let mut child = Command::new(&self.command)
            .args(args)
            .current_dir(vm_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                CoordinatorError::ExternalTool(format!("failed to spawn {}: {err}", self.command))
            })?;

        // Output is diagnostic only; stream it but never parse it
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(stream_lines(stdout, "vagrant"));
        let stderr_task = tokio::spawn(stream_lines(stderr, "vagrant stderr"));

        let status = match self.timeout {
            Some(ceiling) => match tokio::time::timeout(ceiling, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    warn!(?args, "provisioning tool exceeded its time ceiling, killing it");
                    child.kill().await?;
                    return Err(CoordinatorError::ExternalTool(format!(
                        "{} {} timed out after {:?}",
                        self.command,
                        args.join(" "),
                        ceiling
                    )));
                }
            },
            None => child.wait().await?,
        };

        let _ = stdout_task.await;
        let _ = stderr_task.await;

        if !status.success() {
            return Err(CoordinatorError::ExternalTool(format!(
                "{} {} exited with {status}",
                self.command,
                args.join(" ")
            )));
        }

        info!(?args, "provisioning tool finished");
        Ok(())
    }
}

impl Default for VagrantProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

async fn stream_lines<R>(reader: Option<R>, label: &'static str)
where
    R: tokio::io::AsyncRead + Unpin + Send,
{
    let Some(reader) = reader else { return };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("[{label}] {line}");
    }
}

#[async_trait]
impl Provisioner for VagrantProvisioner {
    async fn up(&self, vm_dir: &Path) -> Result<(), CoordinatorError> {
        self.run(vm_dir, &["up"]).await
    }

    async fn halt(&self, vm_dir: &Path) -> Result<(), CoordinatorError> {
        self.run(vm_dir, &["halt"]).await
    }

    async fn destroy(&self, vm_dir: &Path) -> Result<(), CoordinatorError> {
        if let Err(err) = self.run(vm_dir, &["destroy", "-f"]).await {
            // The directory still has to go; a half-destroyed VM with its
            // definition removed cannot be retried anyway
            warn!(%err, dir = %vm_dir.display(), "destroy failed, removing directory regardless");
        }
        tokio::fs::remove_dir_all(vm_dir).await?;
        Ok(())
    }
}

/// Render the declarative VM definition (Vagrantfile): base box, private
/// network address, hostname, provider sizing, public-key injection, and
/// an optional user-supplied script run as the new user after the base
/// provisioning completes.
pub fn render_vagrantfile(vm: &VmDefinition) -> String {
    let public_key = vm.public_key_path.display().to_string().replace('\\', "/");

    // The script runs under the new user account, not root; a quoted
    // heredoc keeps its content out of shell expansion
    let custom_script = match vm.provisioning_script.as_deref() {
        Some(script) if !script.trim().is_empty() => format!(
            "\n    sudo -i -u {} bash <<'EOF'\n{}\nEOF\n",
            vm.name,
            script.trim_end()
        ),
        _ => String::new(),
    };

    format!(
        r#"Vagrant.configure("2") do |config|
  config.vm.box = "{image}"
  config.vm.network "private_network", ip: "{ip}"
  config.vm.hostname = "{name}"

  config.vm.provider "virtualbox" do |vb|
    vb.memory = "{ram}"
    vb.cpus = "{cpu}"
  end

  config.ssh.insert_key = false

  config.vm.provision "file", source: "{public_key}", destination: "/tmp/user_public_key.pub"

  config.vm.provision "shell", privileged: true, inline: <<-SHELL
    NEW_USERNAME="{name}"
    useradd --create-home --shell /bin/bash "$NEW_USERNAME"
    if command -v apt-get >/dev/null 2>&1; then
      usermod -aG sudo "$NEW_USERNAME"
      echo "$NEW_USERNAME ALL=(ALL) NOPASSWD:ALL" > /etc/sudoers.d/$NEW_USERNAME
      chmod 440 /etc/sudoers.d/$NEW_USERNAME
    else
      usermod -aG wheel "$NEW_USERNAME"
    fi
    mkdir -p /home/$NEW_USERNAME/.ssh
    cat /tmp/user_public_key.pub > /home/$NEW_USERNAME/.ssh/authorized_keys
    chown -R $NEW_USERNAME:$NEW_USERNAME /home/$NEW_USERNAME/.ssh
    chmod 700 /home/$NEW_USERNAME/.ssh
    chmod 600 /home/$NEW_USERNAME/.ssh/authorized_keys
    systemctl restart sshd || systemctl restart ssh{script}
  SHELL
end
"#,
        image = vm.image,
        ip = vm.private_ip,
        name = vm.name,
        ram = vm.ram,
        cpu = vm.cpu,
        script = custom_script,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> VmDefinition {
        VmDefinition {
            name: "alpha".to_string(),
            image: "generic/ubuntu2204".to_string(),
            ram: 2048,
            cpu: 2,
            private_ip: "192.168.56.11".to_string(),
            public_key_path: PathBuf::from("/keys/alpha.pub"),
            provisioning_script: None,
        }
    }

    #[test]
    fn vagrantfile_carries_definition_fields() {
        let rendered = render_vagrantfile(&definition());

        assert!(rendered.contains(r#"config.vm.box = "generic/ubuntu2204""#));
        assert!(rendered.contains(r#"ip: "192.168.56.11""#));
        assert!(rendered.contains(r#"config.vm.hostname = "alpha""#));
        assert!(rendered.contains(r#"vb.memory = "2048""#));
        assert!(rendered.contains(r#"vb.cpus = "2""#));
        assert!(rendered.contains("/keys/alpha.pub"));
        assert!(!rendered.contains("sudo -i -u"));
    }

    #[test]
    fn vagrantfile_runs_custom_script_as_the_new_user() {
        let mut definition = definition();
        definition.provisioning_script =
            Some("apt-get install -y docker.io\nusermod -aG docker alpha".to_string());

        let rendered = render_vagrantfile(&definition);

        assert!(rendered.contains("sudo -i -u alpha bash <<'EOF'"));
        assert!(rendered.contains("apt-get install -y docker.io"));
        assert!(rendered.contains("usermod -aG docker alpha\nEOF"));
    }

    #[test]
    fn blank_custom_script_is_omitted() {
        let mut definition = definition();
        definition.provisioning_script = Some("   \n".to_string());

        let rendered = render_vagrantfile(&definition);
        assert!(!rendered.contains("EOF"));
    }
}
