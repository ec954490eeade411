//! Resource allocation and reconciliation engine
//!
//! Provisions lightweight VMs on a single host and exposes them to the
//! internet through a reverse tunnel, keeping three independently-failing
//! systems consistent: the local record store, the tunnel client's text
//! configuration file, and a remote firewall API. One coordinator-level lock
//! serializes every operation that allocates from a finite pool or writes
//! shared state.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod firewall;
pub mod pool;
pub mod provisioner;
pub mod reconciler;
pub mod supervisor;
pub mod tasks;

pub use config::ControllerConfig;
pub use coordinator::{AllocationCoordinator, CreateVmRequest, CreatedVm, RuleRequest};
pub use error::CoordinatorError;
pub use firewall::{FirewallGateway, SecurityGroupClient};
pub use pool::Pool;
pub use provisioner::{Provisioner, VagrantProvisioner};
pub use reconciler::{ConfigReconciler, ProxyEntry, TunnelConfig};
pub use supervisor::{TunnelControl, TunnelSupervisor};
pub use tasks::BackgroundRunner;
