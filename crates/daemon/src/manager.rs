// Manager service: owns the binding map and the session pool, serialises
// their mutations and drives the kernel glue around session transitions.
//
// Lock discipline: `bindings` is always taken before `sessions` when both
// are needed, and kernel mutations run while the sessions lock is held so
// transitions are applied to the kernel one at a time. Watchdog fires enter
// through the command channel and are applied by the dispatcher task under
// the same discipline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

use tundev_common::error::{ManagerError, Result};
use tundev_common::tunnel::{TunnelConfig, TunnelMode};
use tundev_common::types::{InterfaceStatus, ManagerEvent, RegisterBindingRequest, Role};

use crate::binding::TundevBinding;
use crate::config::DaemonConfig;
use crate::kernel::KernelGlue;
use crate::roles::RoleTable;
use crate::session::{Session, SessionPool, SessionState};
use crate::supervisor::TunnelSupervisor;
use crate::watchdog::{self, ManagerCommand};

/// Kernel-level mode of a session, agreed by both sides or invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionKernelMode {
    L3,
    L2,
    Invalid,
}

/// Cloneable handle to the manager state; API handlers and the dispatcher
/// all hold the same inner.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: DaemonConfig,
    roles: RoleTable,
    kernel: KernelGlue,
    bindings: Mutex<HashMap<String, TundevBinding>>,
    sessions: Mutex<SessionPool>,
    events: broadcast::Sender<ManagerEvent>,
    commands_tx: mpsc::UnboundedSender<ManagerCommand>,
    watchdog_generation: AtomicU64,
}

impl Manager {
    /// Build the manager. The returned receiver feeds `run_dispatcher`.
    pub fn new(
        config: DaemonConfig,
        kernel: KernelGlue,
    ) -> (Self, mpsc::UnboundedReceiver<ManagerCommand>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let roles = RoleTable::new(config.role_overrides.clone());
        let manager = Manager {
            inner: Arc::new(ManagerInner {
                config,
                roles,
                kernel,
                bindings: Mutex::new(HashMap::new()),
                sessions: Mutex::new(SessionPool::new()),
                events,
                commands_tx,
                watchdog_generation: AtomicU64::new(0),
            }),
        };
        (manager, commands_rx)
    }

    /// Subscribe to manager events (SSE handlers and tests).
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }

    /// Consume watchdog fires until the manager goes away.
    pub async fn run_dispatcher(self, mut rx: mpsc::UnboundedReceiver<ManagerCommand>) {
        while let Some(command) = rx.recv().await {
            self.handle_command(command).await;
        }
    }

    pub async fn handle_command(&self, command: ManagerCommand) {
        match command {
            ManagerCommand::WatchdogFired {
                username,
                generation,
            } => {
                let mut bindings = self.inner.bindings.lock().await;
                let current = bindings.get(&username).map(|b| b.watchdog.generation);
                if current != Some(generation) {
                    debug!(username = %username, generation, "Stale watchdog fire, ignoring");
                    return;
                }
                warn!(username = %username, "Shell-alive lock released, tearing down binding");
                if let Err(e) = self.unregister_locked(&mut bindings, &username).await {
                    // Cleanup must never kill the dispatcher
                    warn!(username = %username, "Watchdog teardown error: {}", e);
                }
            }
        }
    }

    /// RegisterTundevBinding. An existing binding for the same username is
    /// destroyed first.
    pub async fn register_binding(&self, request: &RegisterBindingRequest) -> Result<String> {
        let role = self.inner.roles.resolve(&request.username)?;

        let mut bindings = self.inner.bindings.lock().await;
        if let Some(mut old) = bindings.remove(&request.username) {
            warn!(
                username = %request.username,
                "Duplicate username registration, destroying the previous binding"
            );
            old.destroy().await;
        }

        let profile = self.inner.config.profile_for(role);
        let secret = generate_secret();
        let mut config = TunnelConfig::new(
            request.mode,
            profile.tunnel_network,
            Some(profile.tcp_port),
            &request.username,
            &secret,
        )?;
        let hook = self.inner.config.hook_path.display();
        config.set_hooks(
            &format!("{} up {} %%", hook, request.username),
            &format!("{} down {} %%", hook, request.username),
        );

        let mut supervisor = TunnelSupervisor::new(
            &request.username,
            &self.inner.config.runtime_dir,
            &self.inner.config.vtund_path,
        );
        supervisor.configure(config);

        let generation = self
            .inner
            .watchdog_generation
            .fetch_add(1, Ordering::SeqCst)
            + 1;
        let watchdog = watchdog::spawn(
            &request.username,
            generation,
            &request.lockfile,
            self.inner.commands_tx.clone(),
        )?;

        let binding = TundevBinding {
            username: request.username.clone(),
            role,
            lan_ip: request.lan_ip,
            lan_dns: request.lan_dns.clone(),
            hostname: request.hostname.clone(),
            uplink_type: request.uplink_type.clone(),
            supervisor,
            watchdog,
            current_iface: None,
        };
        let path = binding.object_path();
        info!(username = %request.username, %role, "Registered tundev binding");
        bindings.insert(request.username.clone(), binding);
        Ok(path)
    }

    /// UnregisterTundevBinding. Missing username is a no-op.
    pub async fn unregister_binding(&self, username: &str) -> Result<()> {
        let mut bindings = self.inner.bindings.lock().await;
        self.unregister_locked(&mut bindings, username).await
    }

    async fn unregister_locked(
        &self,
        bindings: &mut HashMap<String, TundevBinding>,
        username: &str,
    ) -> Result<()> {
        let Some(mut binding) = bindings.remove(username) else {
            debug!(username, "Unregister for unknown binding is a no-op");
            return Ok(());
        };
        binding.destroy().await;

        let mut sessions = self.inner.sessions.lock().await;
        let removed = sessions.remove_involving(username);
        for session in &removed {
            if session.state() == SessionState::Up {
                let mode = session_mode(Some(&binding), bindings, session);
                let other_up = sessions.any_other_up(&session.master_id, &session.onsite_id);
                self.unstitch(mode, session, other_up).await;
            }
            let peer = session.peer_of(username).to_string();
            if let Some(peer_binding) = bindings.get_mut(&peer) {
                if peer_binding.supervisor.is_running() {
                    info!(peer = %peer, "Stopping peer tunnel after unregister");
                    if let Err(e) = peer_binding.supervisor.stop().await {
                        warn!(peer = %peer, "Failed to stop peer tunnel: {}", e);
                    }
                }
            }
        }

        let _ = self.inner.events.send(ManagerEvent::BindingRemoved {
            username: username.to_string(),
        });
        info!(username, "Unregistered tundev binding");
        Ok(())
    }

    /// ConnectMasterDevToOnsiteDev: record the pairing, copy the master's
    /// tunnel mode onto the onsite config and signal the waiting onsite
    /// shell. The master is authoritative for the session mode.
    pub async fn connect_master_to_onsite(&self, master_id: &str, onsite_id: &str) -> Result<()> {
        let mut bindings = self.inner.bindings.lock().await;

        let master_mode = {
            let master = bindings
                .get(master_id)
                .filter(|b| b.role == Role::Master)
                .ok_or_else(|| ManagerError::MasterNotRegistered(master_id.to_string()))?;
            master
                .supervisor
                .config()
                .map(|c| c.mode)
                .ok_or_else(|| ManagerError::NoTunnelConfigFor(master_id.to_string()))?
        };
        if !bindings
            .get(onsite_id)
            .is_some_and(|b| b.role == Role::Onsite)
        {
            return Err(ManagerError::OnsiteNotRegistered(onsite_id.to_string()));
        }

        {
            let mut sessions = self.inner.sessions.lock().await;
            sessions.add(master_id, onsite_id)?;
        }

        if let Some(onsite) = bindings.get_mut(onsite_id) {
            onsite.supervisor.set_mode(master_mode)?;
        }

        info!(master_id, onsite_id, mode = %master_mode, "Recorded session pairing");
        let _ = self.inner.events.send(ManagerEvent::VtunAllowed {
            username: onsite_id.to_string(),
        });
        Ok(())
    }

    /// TunnelInterfaceStatusUpdate: apply an up/down report and run the
    /// kernel glue for every session transition it causes.
    pub async fn interface_status_update(
        &self,
        device_id: &str,
        iface: &str,
        status: &str,
    ) -> Result<()> {
        let status: InterfaceStatus = status.parse()?;

        let mut bindings = self.inner.bindings.lock().await;
        {
            let binding = bindings
                .get_mut(device_id)
                .ok_or_else(|| ManagerError::UnknownDevice(device_id.to_string()))?;
            binding.current_iface = match status {
                InterfaceStatus::Up => Some(iface.to_string()),
                InterfaceStatus::Down => None,
            };
        }
        info!(device_id, iface, %status, "Tunnel interface status update");

        let mut sessions = self.inner.sessions.lock().await;
        let transitions = sessions.update_iface(device_id, iface, status);
        for transition in &transitions {
            let mode = session_mode(None, &bindings, &transition.after);
            match (transition.previous_state(), transition.new_state()) {
                (SessionState::InProgress, SessionState::Up) => {
                    self.stitch(mode, &transition.after, &bindings).await;
                }
                (SessionState::Up, SessionState::InProgress) => {
                    let other_up =
                        sessions.any_other_up(&transition.after.master_id, &transition.after.onsite_id);
                    self.unstitch(mode, &transition.before, other_up).await;

                    // Cascade: the peer's tunnel goes down too; its own down
                    // callback then finds the session already in-progress
                    let peer = transition.after.peer_of(device_id).to_string();
                    if let Some(peer_binding) = bindings.get_mut(&peer) {
                        if peer_binding.supervisor.is_running() {
                            info!(peer = %peer, "Stopping peer tunnel after interface down");
                            if let Err(e) = peer_binding.supervisor.stop().await {
                                warn!(peer = %peer, "Failed to stop peer tunnel: {}", e);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn stitch(
        &self,
        mode: SessionKernelMode,
        session: &Session,
        bindings: &HashMap<String, TundevBinding>,
    ) {
        let (Some(master_iface), Some(onsite_iface)) =
            (&session.master_iface, &session.onsite_iface)
        else {
            return;
        };
        match mode {
            SessionKernelMode::L3 => {
                let gateways = bindings
                    .get(&session.onsite_id)
                    .and_then(|b| b.supervisor.config())
                    .map(|c| c.far_ip.to_string())
                    .zip(
                        bindings
                            .get(&session.master_id)
                            .and_then(|b| b.supervisor.config())
                            .map(|c| c.far_ip.to_string()),
                    );
                match gateways {
                    Some((onsite_gw, master_gw)) => {
                        self.inner
                            .kernel
                            .stitch_l3(master_iface, onsite_iface, &onsite_gw, &master_gw)
                            .await;
                    }
                    None => warn!(
                        master_id = %session.master_id,
                        onsite_id = %session.onsite_id,
                        "Missing tunnel config for a session side, skipping stitch"
                    ),
                }
            }
            SessionKernelMode::L2 => {
                self.inner.kernel.stitch_l2(master_iface, onsite_iface).await;
            }
            SessionKernelMode::Invalid => {
                warn!(
                    master_id = %session.master_id,
                    onsite_id = %session.onsite_id,
                    "Session tunnel mode combination is invalid, skipping stitch"
                );
            }
        }
    }

    async fn unstitch(&self, mode: SessionKernelMode, session: &Session, other_up: bool) {
        let (Some(master_iface), Some(onsite_iface)) =
            (&session.master_iface, &session.onsite_iface)
        else {
            warn!(
                master_id = %session.master_id,
                onsite_id = %session.onsite_id,
                "Session snapshot is missing an interface name, skipping unstitch"
            );
            return;
        };
        match mode {
            SessionKernelMode::L3 => {
                self.inner
                    .kernel
                    .unstitch_l3(master_iface, onsite_iface, other_up)
                    .await;
            }
            SessionKernelMode::L2 => {
                self.inner.kernel.unstitch_l2(master_iface, onsite_iface).await;
            }
            SessionKernelMode::Invalid => {
                warn!(
                    master_id = %session.master_id,
                    onsite_id = %session.onsite_id,
                    "Session tunnel mode combination is invalid, skipping unstitch"
                );
            }
        }
    }

    /// Per-binding ConfigureService: re-set the tunnel mode.
    pub async fn configure_service(&self, username: &str, mode: TunnelMode) -> Result<()> {
        let mut bindings = self.inner.bindings.lock().await;
        let binding = bindings
            .get_mut(username)
            .ok_or_else(|| ManagerError::UnknownDevice(username.to_string()))?;
        binding.supervisor.set_mode(mode)
    }

    /// Per-binding StartTunnelServer. A spawn failure is fatal to the
    /// binding: the manager cleans it up before surfacing the error.
    pub async fn start_tunnel_server(&self, username: &str) -> Result<()> {
        let mut bindings = self.inner.bindings.lock().await;
        let start_result = match bindings.get_mut(username) {
            Some(binding) => binding.supervisor.start().await,
            None => return Err(ManagerError::UnknownDevice(username.to_string())),
        };
        if let Err(e) = start_result {
            warn!(username, "Tunnel daemon spawn failed, destroying binding: {}", e);
            if let Err(cleanup) = self.unregister_locked(&mut bindings, username).await {
                warn!(username, "Cleanup after spawn failure also failed: {}", cleanup);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Per-binding StopTunnelServer (`drop_vtun`).
    pub async fn stop_tunnel_server(&self, username: &str) -> Result<()> {
        let mut bindings = self.inner.bindings.lock().await;
        let binding = bindings
            .get_mut(username)
            .ok_or_else(|| ManagerError::UnknownDevice(username.to_string()))?;
        binding.supervisor.stop().await
    }

    /// Per-binding GetAssociatedClientTundevShellConfig: the peer-shell
    /// rendering of the client-derived tunnel config.
    pub async fn client_shell_config(&self, username: &str) -> Result<String> {
        let bindings = self.inner.bindings.lock().await;
        let binding = bindings
            .get(username)
            .ok_or_else(|| ManagerError::UnknownDevice(username.to_string()))?;
        let config = binding
            .supervisor
            .config()
            .ok_or_else(|| ManagerError::NoTunnelConfigFor(username.to_string()))?;
        config.derive_client().to_peer_shell_output()
    }

    /// DumpTundevBindings: object paths of all live bindings.
    pub async fn dump_bindings(&self) -> Vec<String> {
        let bindings = self.inner.bindings.lock().await;
        for binding in bindings.values() {
            debug!(
                username = %binding.username,
                role = %binding.role,
                hostname = ?binding.hostname,
                uplink = ?binding.uplink_type,
                dns = ?binding.lan_dns,
                iface = ?binding.current_iface,
                "Live binding"
            );
        }
        let mut paths: Vec<String> = bindings.values().map(TundevBinding::object_path).collect();
        paths.sort();
        paths
    }

    /// GetOnlineOnsiteDevs: usernames of registered onsite devices.
    pub async fn online_onsite_devs(&self) -> Vec<String> {
        let bindings = self.inner.bindings.lock().await;
        let mut devices: Vec<String> = bindings
            .values()
            .filter(|b| b.role == Role::Onsite)
            .map(|b| b.username.clone())
            .collect();
        devices.sort();
        devices
    }

    /// DumpSessions: textual descriptors.
    pub async fn dump_sessions(&self) -> Vec<String> {
        // Lock order: bindings is not needed here, sessions alone is fine
        let sessions = self.inner.sessions.lock().await;
        sessions.describe_all()
    }

    /// GetOnsiteDevLanConfig: the LAN CIDR of the onsite device paired with
    /// `master_id`, or empty when unknown.
    pub async fn onsite_lan_config(&self, master_id: &str) -> String {
        let bindings = self.inner.bindings.lock().await;
        let sessions = self.inner.sessions.lock().await;
        let Some(session) = sessions.find_by_master(master_id) else {
            return String::new();
        };
        bindings
            .get(&session.onsite_id)
            .and_then(|b| b.lan_ip)
            .map(|net| net.to_string())
            .unwrap_or_default()
    }

    /// Destroy all bindings and their sessions. The daemon's shutdown path.
    pub async fn shutdown(&self) {
        info!("Destroying all bindings");
        let mut bindings = self.inner.bindings.lock().await;
        let usernames: Vec<String> = bindings.keys().cloned().collect();
        for username in usernames {
            if let Err(e) = self.unregister_locked(&mut bindings, &username).await {
                warn!(username = %username, "Error during shutdown teardown: {}", e);
            }
        }
    }
}

/// Session-wide kernel mode: L3 when both sides run L3, L2 when both run
/// L2, invalid otherwise. A binding removed from the map mid-teardown is
/// passed alongside so its config still participates.
fn session_mode(
    removed: Option<&TundevBinding>,
    bindings: &HashMap<String, TundevBinding>,
    session: &Session,
) -> SessionKernelMode {
    let mode_of = |username: &str| -> Option<TunnelMode> {
        if let Some(binding) = removed.filter(|b| b.username == username) {
            return binding.supervisor.config().map(|c| c.mode);
        }
        bindings
            .get(username)
            .and_then(|b| b.supervisor.config())
            .map(|c| c.mode)
    };
    match (mode_of(&session.master_id), mode_of(&session.onsite_id)) {
        (Some(TunnelMode::L3), Some(TunnelMode::L3)) => SessionKernelMode::L3,
        (Some(TunnelMode::L2), Some(TunnelMode::L2)) => SessionKernelMode::L2,
        _ => SessionKernelMode::Invalid,
    }
}

fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use crate::config::ListenerMode;
    use crate::kernel::sim::FakeKernel;
    use tundev_common::lockfile::ShellAliveLock;

    struct Harness {
        manager: Manager,
        commands_rx: mpsc::UnboundedReceiver<ManagerCommand>,
        fake: Arc<FakeKernel>,
        _runtime_dir: tempfile::TempDir,
        lock_dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let runtime_dir = tempfile::tempdir().unwrap();
        let lock_dir = tempfile::tempdir().unwrap();

        let mut config = DaemonConfig::default();
        config.listener_mode = ListenerMode::TcpHttp;
        config.runtime_dir = runtime_dir.path().to_path_buf();
        // Any spawnable binary works as the tunnel daemon in tests
        config.vtund_path = PathBuf::from("/bin/sleep");
        config.role_overrides.insert("onsite_a".into(), Role::Onsite);
        config.role_overrides.insert("onsite_b".into(), Role::Onsite);
        config.role_overrides.insert("master_a".into(), Role::Master);

        let fake = Arc::new(FakeKernel::new());
        let kernel = KernelGlue::new(fake.clone());
        let (manager, commands_rx) = Manager::new(config, kernel);
        Harness {
            manager,
            commands_rx,
            fake,
            _runtime_dir: runtime_dir,
            lock_dir,
        }
    }

    fn register_request(username: &str, mode: TunnelMode, lockfile: &Path) -> RegisterBindingRequest {
        RegisterBindingRequest {
            username: username.to_string(),
            mode,
            lan_ip: None,
            lan_dns: Vec::new(),
            hostname: None,
            uplink_type: None,
            lockfile: lockfile.to_path_buf(),
        }
    }

    fn shell_lock(h: &Harness, username: &str) -> ShellAliveLock {
        let path = h.lock_dir.path().join(format!("{}.lock", username));
        ShellAliveLock::acquire(&path, username).unwrap()
    }

    async fn register(h: &Harness, username: &str, mode: TunnelMode, lock: &ShellAliveLock) -> String {
        h.manager
            .register_binding(&register_request(username, mode, lock.path()))
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn register_returns_the_binding_object_path() {
        let h = harness();
        let lock = shell_lock(&h, "onsite_a");
        let path = register(&h, "onsite_a", TunnelMode::L3, &lock).await;
        assert_eq!(path, "/TundevManager/onsite_a");
        assert_eq!(h.manager.dump_bindings().await, vec![path]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_account_cannot_register() {
        let h = harness();
        let lock = shell_lock(&h, "stranger");
        let err = h
            .manager
            .register_binding(&register_request(
                "account-that-does-not-exist",
                TunnelMode::L3,
                lock.path(),
            ))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UnknownTundevAccount");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_register_replaces_the_binding() {
        let h = harness();
        let lock1 = shell_lock(&h, "onsite_a");
        register(&h, "onsite_a", TunnelMode::L3, &lock1).await;

        let path2 = h.lock_dir.path().join("onsite_a-second.lock");
        let lock2 = ShellAliveLock::acquire(&path2, "onsite_a").unwrap();
        let path = register(&h, "onsite_a", TunnelMode::L3, &lock2).await;

        assert_eq!(path, "/TundevManager/onsite_a");
        assert_eq!(h.manager.dump_bindings().await.len(), 1);

        // The replaced binding's watchdog was disarmed during destroy, so
        // the first shell's lock release must stay silent
        drop(lock1);
        let manager = h.manager.clone();
        let mut rx = h.commands_rx;
        let outcome = tokio::time::timeout(std::time::Duration::from_millis(500), rx.recv()).await;
        assert!(outcome.is_err(), "disarmed watchdog must not fire");

        // A fabricated stale-generation fire must not kill the fresh
        // binding either
        manager
            .handle_command(ManagerCommand::WatchdogFired {
                username: "onsite_a".to_string(),
                generation: 9999,
            })
            .await;
        assert_eq!(manager.dump_bindings().await.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pairing_requires_both_registrations() {
        let h = harness();
        let onsite_lock = shell_lock(&h, "onsite_a");

        let err = h
            .manager
            .connect_master_to_onsite("master_a", "onsite_a")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "MasterNotRegistered");

        let master_lock = shell_lock(&h, "master_a");
        register(&h, "master_a", TunnelMode::L3, &master_lock).await;
        let err = h
            .manager
            .connect_master_to_onsite("master_a", "onsite_a")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "OnsiteNotRegistered");

        register(&h, "onsite_a", TunnelMode::L3, &onsite_lock).await;
        h.manager
            .connect_master_to_onsite("master_a", "onsite_a")
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pairing_copies_the_masters_mode_and_signals_the_onsite() {
        let h = harness();
        let onsite_lock = shell_lock(&h, "onsite_a");
        let master_lock = shell_lock(&h, "master_a");
        register(&h, "onsite_a", TunnelMode::L3, &onsite_lock).await;
        register(&h, "master_a", TunnelMode::L2, &master_lock).await;

        let mut events = h.manager.subscribe();
        h.manager
            .connect_master_to_onsite("master_a", "onsite_a")
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            ManagerEvent::VtunAllowed { username } => assert_eq!(username, "onsite_a"),
            other => panic!("expected VtunAllowed, got {:?}", other),
        }

        // The onsite's rendering now reflects the master's L2 choice: a tap
        // interface would be derived for it
        let config = h.manager.client_shell_config("onsite_a").await.unwrap();
        assert!(config.contains("rdv_server_vtun_tcp_port: 5000"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_identical_pairing_is_rejected() {
        let h = harness();
        let onsite_lock = shell_lock(&h, "onsite_a");
        let master_lock = shell_lock(&h, "master_a");
        register(&h, "onsite_a", TunnelMode::L3, &onsite_lock).await;
        register(&h, "master_a", TunnelMode::L3, &master_lock).await;

        h.manager
            .connect_master_to_onsite("master_a", "onsite_a")
            .await
            .unwrap();
        let err = h
            .manager
            .connect_master_to_onsite("master_a", "onsite_a")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DevicesAlreadyConnected");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn interface_updates_validate_their_inputs() {
        let h = harness();
        let err = h
            .manager
            .interface_status_update("onsite_a", "tun_to_onsite_a", "sideways")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "InvalidInterfaceStatus");

        let err = h
            .manager
            .interface_status_update("onsite_a", "tun_to_onsite_a", "up")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UnknownDevice");
    }

    async fn bring_session_up(h: &Harness) {
        h.manager
            .connect_master_to_onsite("master_a", "onsite_a")
            .await
            .unwrap();
        h.manager.start_tunnel_server("onsite_a").await.unwrap();
        h.manager.start_tunnel_server("master_a").await.unwrap();
        h.manager
            .interface_status_update("onsite_a", "tun_to_onsite_a", "up")
            .await
            .unwrap();
        h.manager
            .interface_status_update("master_a", "tun_to_master_a", "up")
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn l3_session_stitches_on_both_up_and_master_exit_cascades() {
        let h = harness();
        let onsite_lock = shell_lock(&h, "onsite_a");
        let master_lock = shell_lock(&h, "master_a");
        register(&h, "onsite_a", TunnelMode::L3, &onsite_lock).await;
        register(&h, "master_a", TunnelMode::L3, &master_lock).await;
        bring_session_up(&h).await;

        {
            let state = h.fake.state.lock().unwrap();
            assert!(state.ip_forward);
            assert_eq!(state.filter_rules.len(), 2);
            assert_eq!(state.nat_rules.len(), 1);
            assert_eq!(state.routes.len(), 2);
        }
        assert_eq!(
            h.manager.dump_sessions().await,
            vec!["master_a <=> onsite_a [up]"]
        );

        // Master exits: session cleared, onsite tunnel stopped, kernel
        // state unwound, forwarding back off
        h.manager.unregister_binding("master_a").await.unwrap();

        assert!(h.manager.dump_sessions().await.is_empty());
        let state = h.fake.state.lock().unwrap();
        assert!(state.filter_rules.is_empty());
        assert!(state.nat_rules.is_empty());
        assert!(state.ip_rules.is_empty());
        assert!(state.routes.is_empty());
        assert!(!state.ip_forward);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn l2_session_builds_and_removes_the_bridge() {
        let h = harness();
        let onsite_lock = shell_lock(&h, "onsite_a");
        let master_lock = shell_lock(&h, "master_a");
        // Onsite defaults to L3; the pairing flips it to the master's L2
        register(&h, "onsite_a", TunnelMode::L3, &onsite_lock).await;
        register(&h, "master_a", TunnelMode::L2, &master_lock).await;

        h.manager
            .connect_master_to_onsite("master_a", "onsite_a")
            .await
            .unwrap();
        h.manager
            .interface_status_update("onsite_a", "tap_to_onsite_a", "up")
            .await
            .unwrap();
        h.manager
            .interface_status_update("master_a", "tap_to_master_a", "up")
            .await
            .unwrap();

        {
            let state = h.fake.state.lock().unwrap();
            assert!(state.bridge && state.bridge_up);
            assert_eq!(state.bridge_members.len(), 2);
        }

        h.manager
            .interface_status_update("onsite_a", "tap_to_onsite_a", "down")
            .await
            .unwrap();
        let state = h.fake.state.lock().unwrap();
        assert!(!state.bridge, "no residual bridge after either side drops");
        assert!(state.filter_rules.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn watchdog_fire_unregisters_and_tears_down_the_peer() {
        let h = harness();
        let onsite_lock = shell_lock(&h, "onsite_a");
        let master_lock = shell_lock(&h, "master_a");
        register(&h, "onsite_a", TunnelMode::L3, &onsite_lock).await;
        register(&h, "master_a", TunnelMode::L3, &master_lock).await;
        bring_session_up(&h).await;

        // The onsite shell dies without saying goodbye
        drop(onsite_lock);
        let mut rx = h.commands_rx;
        let command = rx.recv().await.expect("watchdog should fire");
        h.manager.handle_command(command).await;

        assert_eq!(
            h.manager.dump_bindings().await,
            vec!["/TundevManager/master_a"]
        );
        assert!(h.manager.dump_sessions().await.is_empty());
        let state = h.fake.state.lock().unwrap();
        assert!(state.filter_rules.is_empty());
        assert!(!state.ip_forward);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn onsite_lan_config_follows_the_pairing() {
        let h = harness();
        let onsite_lock = shell_lock(&h, "onsite_a");
        let master_lock = shell_lock(&h, "master_a");

        let mut request = register_request("onsite_a", TunnelMode::L3, onsite_lock.path());
        request.lan_ip = Some("192.168.1.2/24".parse().unwrap());
        h.manager.register_binding(&request).await.unwrap();
        register(&h, "master_a", TunnelMode::L3, &master_lock).await;

        assert_eq!(h.manager.onsite_lan_config("master_a").await, "");
        h.manager
            .connect_master_to_onsite("master_a", "onsite_a")
            .await
            .unwrap();
        assert_eq!(
            h.manager.onsite_lan_config("master_a").await,
            "192.168.1.2/24"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn online_onsite_devs_lists_only_onsite_roles() {
        let h = harness();
        let a = shell_lock(&h, "onsite_a");
        let b = shell_lock(&h, "onsite_b");
        let m = shell_lock(&h, "master_a");
        register(&h, "onsite_a", TunnelMode::L3, &a).await;
        register(&h, "onsite_b", TunnelMode::L3, &b).await;
        register(&h, "master_a", TunnelMode::L3, &m).await;

        assert_eq!(
            h.manager.online_onsite_devs().await,
            vec!["onsite_a", "onsite_b"]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spawn_failure_is_fatal_to_the_binding() {
        let h = harness();
        let runtime_dir = tempfile::tempdir().unwrap();
        let mut config = DaemonConfig::default();
        config.runtime_dir = runtime_dir.path().to_path_buf();
        config.vtund_path = PathBuf::from("/nonexistent/vtund-for-tests");
        config.role_overrides.insert("onsite_a".into(), Role::Onsite);
        let (manager, _rx) = Manager::new(config, KernelGlue::new(h.fake.clone()));

        let lock = shell_lock(&h, "onsite_a");
        manager
            .register_binding(&register_request("onsite_a", TunnelMode::L3, lock.path()))
            .await
            .unwrap();

        let err = manager.start_tunnel_server("onsite_a").await.unwrap_err();
        assert_eq!(err.code(), "SpawnFailure");
        assert!(manager.dump_bindings().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shell_config_renders_the_client_side() {
        let h = harness();
        let lock = shell_lock(&h, "onsite_a");
        register(&h, "onsite_a", TunnelMode::L3, &lock).await;

        let config = h.manager.client_shell_config("onsite_a").await.unwrap();
        let lines: Vec<&str> = config.lines().collect();
        assert_eq!(lines[0], "tunnel_ip_network: 192.168.100.0");
        assert_eq!(lines[3], "tunnelling_dev_ip_address: 192.168.100.2");
        assert_eq!(lines[4], "rdv_server_ip_address: 192.168.100.1");
        assert_eq!(lines[5], "rdv_server_vtun_tcp_port: 5000");

        let err = h.manager.client_shell_config("ghost").await.unwrap_err();
        assert_eq!(err.code(), "UnknownDevice");
    }
}
