//! Kernel-side session plumbing: IP forwarding, forwarding ACLs, policy
//! routing, NAT masquerade and the L2 bridge.
//!
//! All operations are idempotent so a repeated transition never stacks
//! duplicate rules, and teardown failures are logged rather than raised;
//! partial state is reconciled by the next transition. The command runner
//! is a seam: the default backend shells out, and a netlink backend could
//! replace it without touching the manager.

pub mod commands;

use std::io;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Result of one executed command.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Backend executing kernel configuration commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, cmd: &str) -> io::Result<ExecResult>;
}

/// Process-backed runner: executes through `/bin/sh -c`.
#[derive(Debug, Default)]
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, cmd: &str) -> io::Result<ExecResult> {
        debug!(command = %cmd, "Executing kernel command");
        let output = Command::new("/bin/sh")
            .arg("-c")
            .arg(cmd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Idempotent application/rollback of the kernel state for one session.
#[derive(Clone)]
pub struct KernelGlue {
    runner: Arc<dyn CommandRunner>,
}

impl KernelGlue {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        KernelGlue { runner }
    }

    /// Probe: true when the command succeeds.
    async fn probe(&self, cmd: &str) -> bool {
        match self.runner.run(cmd).await {
            Ok(result) => result.success(),
            Err(e) => {
                warn!(command = %cmd, "Probe failed to execute: {}", e);
                false
            }
        }
    }

    /// Apply a mutation; failures are logged, never raised.
    async fn apply(&self, cmd: &str) -> bool {
        match self.runner.run(cmd).await {
            Ok(result) if result.success() => true,
            Ok(result) => {
                warn!(
                    command = %cmd,
                    exit_code = result.exit_code,
                    stderr = %result.stderr,
                    "Kernel command failed"
                );
                false
            }
            Err(e) => {
                warn!(command = %cmd, "Kernel command failed to execute: {}", e);
                false
            }
        }
    }

    /// Apply a rule only when its probe says it is missing.
    async fn ensure(&self, check_cmd: &str, add_cmd: &str) {
        if !self.probe(check_cmd).await {
            self.apply(add_cmd).await;
        }
    }

    async fn ip_forward_enabled(&self) -> bool {
        match self.runner.run(&commands::read_ip_forward()).await {
            Ok(result) => result.success() && result.stdout.trim() == "1",
            Err(_) => false,
        }
    }

    /// Wire an L3 session: forwarding, NAT towards the onsite LAN, and one
    /// policy-routing table per direction.
    pub async fn stitch_l3(
        &self,
        master_iface: &str,
        onsite_iface: &str,
        onsite_gw: &str,
        master_gw: &str,
    ) {
        info!(master_iface, onsite_iface, "Stitching L3 session");

        if !self.ip_forward_enabled().await {
            self.apply(&commands::write_ip_forward(true)).await;
        }

        self.ensure(
            &commands::check_forward_accept(master_iface, onsite_iface),
            &commands::add_forward_accept(master_iface, onsite_iface),
        )
        .await;
        self.ensure(
            &commands::check_forward_accept(onsite_iface, master_iface),
            &commands::add_forward_accept(onsite_iface, master_iface),
        )
        .await;

        self.ensure(
            &commands::check_masquerade(onsite_iface),
            &commands::add_masquerade(onsite_iface),
        )
        .await;

        // Traffic entering from the master side routes out towards the
        // onsite LAN, and symmetrically. `route replace` and the
        // delete-before-add rule dance keep re-stitching clean.
        self.apply(&commands::replace_default_route(
            commands::MASTER_SIDE_TABLE,
            onsite_gw,
            onsite_iface,
        ))
        .await;
        self.runner
            .run(&commands::del_iif_rule(master_iface, commands::MASTER_SIDE_TABLE))
            .await
            .ok();
        self.apply(&commands::add_iif_rule(master_iface, commands::MASTER_SIDE_TABLE))
            .await;

        self.apply(&commands::replace_default_route(
            commands::ONSITE_SIDE_TABLE,
            master_gw,
            master_iface,
        ))
        .await;
        self.runner
            .run(&commands::del_iif_rule(onsite_iface, commands::ONSITE_SIDE_TABLE))
            .await
            .ok();
        self.apply(&commands::add_iif_rule(onsite_iface, commands::ONSITE_SIDE_TABLE))
            .await;
    }

    /// Undo `stitch_l3`, in reverse order. IP forwarding goes back off only
    /// when no other session remains up.
    pub async fn unstitch_l3(
        &self,
        master_iface: &str,
        onsite_iface: &str,
        other_session_up: bool,
    ) {
        info!(master_iface, onsite_iface, "Unstitching L3 session");

        self.runner
            .run(&commands::del_iif_rule(onsite_iface, commands::ONSITE_SIDE_TABLE))
            .await
            .ok();
        self.apply(&commands::flush_table(commands::ONSITE_SIDE_TABLE)).await;

        self.runner
            .run(&commands::del_iif_rule(master_iface, commands::MASTER_SIDE_TABLE))
            .await
            .ok();
        self.apply(&commands::flush_table(commands::MASTER_SIDE_TABLE)).await;

        if self.probe(&commands::check_masquerade(onsite_iface)).await {
            self.apply(&commands::del_masquerade(onsite_iface)).await;
        }

        if self
            .probe(&commands::check_forward_accept(onsite_iface, master_iface))
            .await
        {
            self.apply(&commands::del_forward_accept(onsite_iface, master_iface))
                .await;
        }
        if self
            .probe(&commands::check_forward_accept(master_iface, onsite_iface))
            .await
        {
            self.apply(&commands::del_forward_accept(master_iface, onsite_iface))
                .await;
        }

        if !other_session_up && self.ip_forward_enabled().await {
            self.apply(&commands::write_ip_forward(false)).await;
        }
    }

    /// Wire an L2 session: bridge both tap interfaces and accept forwarded
    /// frames entering the bridge.
    pub async fn stitch_l2(&self, master_iface: &str, onsite_iface: &str) {
        info!(master_iface, onsite_iface, "Stitching L2 session");

        if !self.probe(&commands::check_bridge_exists()).await {
            self.apply(&commands::add_bridge()).await;
        }
        self.apply(&commands::enslave_iface(master_iface)).await;
        self.apply(&commands::enslave_iface(onsite_iface)).await;
        self.apply(&commands::set_bridge_up()).await;

        self.ensure(
            &commands::check_forward_accept_in(commands::BRIDGE_NAME),
            &commands::add_forward_accept_in(commands::BRIDGE_NAME),
        )
        .await;
    }

    /// Undo `stitch_l2`, in reverse order, leaving no residual bridge.
    pub async fn unstitch_l2(&self, master_iface: &str, onsite_iface: &str) {
        info!(master_iface, onsite_iface, "Unstitching L2 session");

        if self
            .probe(&commands::check_forward_accept_in(commands::BRIDGE_NAME))
            .await
        {
            self.apply(&commands::del_forward_accept_in(commands::BRIDGE_NAME))
                .await;
        }

        if self.probe(&commands::check_bridge_exists()).await {
            self.apply(&commands::set_bridge_down()).await;
            self.runner.run(&commands::release_iface(master_iface)).await.ok();
            self.runner.run(&commands::release_iface(onsite_iface)).await.ok();
            self.apply(&commands::del_bridge()).await;
        }
    }
}

/// Scoped flip of the default FORWARD policy.
///
/// A rendezvous host must not forward arbitrary traffic between tunnels
/// that have not been stitched, so an ACCEPT default policy is switched to
/// DROP for the manager's lifetime and restored on shutdown.
pub struct ForwardPolicyGuard {
    runner: Arc<dyn CommandRunner>,
    flipped: bool,
}

impl ForwardPolicyGuard {
    pub async fn engage(runner: Arc<dyn CommandRunner>) -> Self {
        let mut flipped = false;
        match runner.run(&commands::read_forward_policy()).await {
            Ok(result) if result.success() && result.stdout.contains("ACCEPT") => {
                info!("Default FORWARD policy is ACCEPT, switching to DROP");
                match runner.run(&commands::set_forward_policy("DROP")).await {
                    Ok(set) if set.success() => flipped = true,
                    Ok(set) => warn!(stderr = %set.stderr, "Failed to set FORWARD policy"),
                    Err(e) => warn!("Failed to set FORWARD policy: {}", e),
                }
            }
            Ok(_) => debug!("Default FORWARD policy is not ACCEPT, leaving it alone"),
            Err(e) => warn!("Could not read FORWARD policy: {}", e),
        }
        ForwardPolicyGuard { runner, flipped }
    }

    /// Restore the policy flipped at start-up. Called from the shutdown
    /// path; errors are logged only.
    pub async fn restore(&self) {
        if !self.flipped {
            return;
        }
        info!("Restoring default FORWARD policy to ACCEPT");
        match self.runner.run(&commands::set_forward_policy("ACCEPT")).await {
            Ok(result) if result.success() => {}
            Ok(result) => warn!(stderr = %result.stderr, "Failed to restore FORWARD policy"),
            Err(e) => warn!("Failed to restore FORWARD policy: {}", e),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::sim::FakeKernel;
    use super::*;

    const MASTER_IF: &str = "tun_to_master_a";
    const ONSITE_IF: &str = "tun_to_onsite_a";

    fn glue() -> (KernelGlue, Arc<FakeKernel>) {
        let fake = Arc::new(FakeKernel::new());
        (KernelGlue::new(fake.clone()), fake)
    }

    #[tokio::test]
    async fn l3_stitch_builds_the_full_rule_set() {
        let (glue, fake) = glue();
        glue.stitch_l3(MASTER_IF, ONSITE_IF, "192.168.100.2", "192.168.101.2")
            .await;

        let state = fake.state.lock().unwrap();
        assert!(state.ip_forward);
        assert_eq!(state.filter_rules.len(), 2, "two FORWARD accept rules");
        assert_eq!(state.nat_rules.len(), 1, "one MASQUERADE rule");
        assert_eq!(state.ip_rules.len(), 2, "one iif rule per table");
        assert_eq!(state.routes.len(), 2, "one default route per table");
    }

    #[tokio::test]
    async fn l3_stitch_is_idempotent() {
        let (glue, fake) = glue();
        glue.stitch_l3(MASTER_IF, ONSITE_IF, "192.168.100.2", "192.168.101.2")
            .await;
        glue.stitch_l3(MASTER_IF, ONSITE_IF, "192.168.100.2", "192.168.101.2")
            .await;

        let state = fake.state.lock().unwrap();
        assert_eq!(state.filter_rules.len(), 2, "no duplicated FORWARD rules");
        assert_eq!(state.nat_rules.len(), 1, "no duplicated MASQUERADE rule");
        assert_eq!(state.ip_rules.len(), 2, "no duplicated iif rules");
    }

    #[tokio::test]
    async fn l3_unstitch_after_double_stitch_leaves_no_residue() {
        let (glue, fake) = glue();
        glue.stitch_l3(MASTER_IF, ONSITE_IF, "192.168.100.2", "192.168.101.2")
            .await;
        glue.stitch_l3(MASTER_IF, ONSITE_IF, "192.168.100.2", "192.168.101.2")
            .await;
        glue.unstitch_l3(MASTER_IF, ONSITE_IF, false).await;

        let state = fake.state.lock().unwrap();
        assert!(state.filter_rules.is_empty());
        assert!(state.nat_rules.is_empty());
        assert!(state.ip_rules.is_empty());
        assert!(state.routes.is_empty());
        assert!(!state.ip_forward);
    }

    #[tokio::test]
    async fn l3_unstitch_keeps_ip_forward_for_other_sessions() {
        let (glue, fake) = glue();
        glue.stitch_l3(MASTER_IF, ONSITE_IF, "192.168.100.2", "192.168.101.2")
            .await;
        glue.unstitch_l3(MASTER_IF, ONSITE_IF, true).await;

        assert!(fake.state.lock().unwrap().ip_forward);
    }

    #[tokio::test]
    async fn l3_unstitch_on_clean_state_is_a_no_op() {
        let (glue, fake) = glue();
        glue.unstitch_l3(MASTER_IF, ONSITE_IF, false).await;

        let state = fake.state.lock().unwrap();
        assert!(state.filter_rules.is_empty());
        assert!(state.nat_rules.is_empty());
    }

    #[tokio::test]
    async fn l2_stitch_bridges_both_interfaces() {
        let (glue, fake) = glue();
        glue.stitch_l2("tap_to_master_a", "tap_to_onsite_a").await;

        let state = fake.state.lock().unwrap();
        assert!(state.bridge && state.bridge_up);
        assert_eq!(state.bridge_members.len(), 2);
        assert_eq!(state.filter_rules.len(), 1, "FORWARD accept on br0");
    }

    #[tokio::test]
    async fn l2_unstitch_removes_the_bridge_entirely() {
        let (glue, fake) = glue();
        glue.stitch_l2("tap_to_master_a", "tap_to_onsite_a").await;
        glue.stitch_l2("tap_to_master_a", "tap_to_onsite_a").await;
        glue.unstitch_l2("tap_to_master_a", "tap_to_onsite_a").await;

        let state = fake.state.lock().unwrap();
        assert!(!state.bridge);
        assert!(state.bridge_members.is_empty());
        assert!(state.filter_rules.is_empty());
    }

    #[tokio::test]
    async fn forward_policy_guard_flips_and_restores() {
        let fake = Arc::new(FakeKernel::new());
        let guard = ForwardPolicyGuard::engage(fake.clone()).await;
        assert_eq!(fake.state.lock().unwrap().forward_policy, "DROP");

        guard.restore().await;
        assert_eq!(fake.state.lock().unwrap().forward_policy, "ACCEPT");
    }

    #[tokio::test]
    async fn forward_policy_guard_leaves_drop_alone() {
        let fake = Arc::new(FakeKernel::new());
        fake.state.lock().unwrap().forward_policy = "DROP".to_string();

        let guard = ForwardPolicyGuard::engage(fake.clone()).await;
        guard.restore().await;
        assert_eq!(
            fake.state.lock().unwrap().forward_policy,
            "DROP",
            "an already-DROP policy must not be touched"
        );
    }
}
