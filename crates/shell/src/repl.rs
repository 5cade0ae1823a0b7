// The device shell: a line-oriented interpreter between the remote device
// and the tundev manager. One state machine serves both roles; commands
// belonging to the other role are unknown.

use std::net::Ipv4Addr;
use std::time::Duration;

use ipnetwork::Ipv4Network;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use tundev_common::error::Result;
use tundev_common::tunnel::TunnelMode;
use tundev_common::types::{ManagerEvent, RegisterBindingRequest, Role};
use tundev_common::{EventListener, ManagerClient, ShellAliveLock};

use crate::parse;
use crate::DebugToggle;

/// How long `wait_vtun_allowed` blocks for the pairing signal.
const WAIT_VTUN_TIMEOUT: Duration = Duration::from_secs(60);

/// What the REPL should do after one command.
#[derive(Debug, PartialEq, Eq)]
pub enum LoopAction {
    Continue,
    /// Leave the REPL. `unregister` is true only for exit/logout/EOF.
    Exit { unregister: bool },
}

pub struct ShellState {
    pub role: Role,
    pub username: String,
    mode: TunnelMode,
    lan_ip: Option<Ipv4Network>,
    lan_dns: Vec<Ipv4Addr>,
    hostname: Option<String>,
    uplink_type: Option<String>,
    binding_path: Option<String>,
    client: ManagerClient,
    lock: ShellAliveLock,
    debug: DebugToggle,
}

impl ShellState {
    pub fn new(
        role: Role,
        username: String,
        client: ManagerClient,
        lock: ShellAliveLock,
        debug: DebugToggle,
    ) -> Self {
        ShellState {
            role,
            username,
            mode: TunnelMode::L3,
            lan_ip: None,
            lan_dns: Vec::new(),
            hostname: None,
            uplink_type: None,
            binding_path: None,
            client,
            lock,
            debug,
        }
    }

    fn registered(&self) -> bool {
        self.binding_path.is_some()
    }

    /// Register with the manager if this shell has not yet done so.
    async fn ensure_registered(&mut self) -> Result<()> {
        if self.registered() {
            return Ok(());
        }
        let request = RegisterBindingRequest {
            username: self.username.clone(),
            mode: self.mode,
            lan_ip: self.lan_ip,
            lan_dns: self.lan_dns.clone(),
            hostname: self.hostname.clone(),
            uplink_type: self.uplink_type.clone(),
            lockfile: self.lock.path().to_path_buf(),
        };
        let path = self.client.register_binding(&request).await?;
        debug!(binding_path = %path, "Registered with the manager");
        self.binding_path = Some(path);
        Ok(())
    }

    /// Best-effort unregister on the way out of the shell.
    pub async fn unregister_quietly(&mut self) {
        if let Err(e) = self.client.unregister_binding(&self.username).await {
            eprintln!("Failed to unregister: {}", e);
        }
        self.binding_path = None;
    }

    /// Handle one input line.
    ///
    /// Domain errors from the manager are printed and the loop continues;
    /// only transport failures (manager gone) escape as `Err`.
    pub async fn dispatch(&mut self, line: &str) -> Result<LoopAction> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(LoopAction::Continue);
        }
        let (command, args) = match line.split_once(char::is_whitespace) {
            Some((command, args)) => (command, args.trim()),
            None => (line, ""),
        };

        match (command, self.role) {
            ("exit" | "logout", _) => return Ok(LoopAction::Exit { unregister: true }),

            ("echo", _) => println!("{}", args),

            ("get_role", _) => println!("{}", self.role),

            ("get_tunnel_mode", _) => println!("{}", self.mode),

            ("debug_mode", _) => match args {
                "on" => self.debug.set(true),
                "off" => self.debug.set(false),
                other => eprintln!("Unsupported debug mode: {}", other),
            },

            ("set_tunnelling_dev_lan_ip_address", _) => match parse::parse_lan_cidr(args) {
                Some(net) => self.lan_ip = Some(net),
                None => eprintln!("Invalid IP network: {}", args),
            },

            ("set_tunnelling_dev_dns_server_list", _) => match parse::parse_dns_list(args) {
                Ok(servers) => self.lan_dns = servers,
                Err(token) => eprintln!("Invalid DNS server: {}", token),
            },

            ("set_tunnelling_dev_hostname", _) => match parse::unquote_hostname(args) {
                Ok(hostname) => self.hostname = Some(hostname),
                Err(raw) => eprintln!("Invalid hostname: {}", raw),
            },

            ("set_tunnelling_dev_uplink_type", Role::Onsite) => match parse::parse_uplink(args) {
                Some(uplink) => self.uplink_type = Some(uplink.to_string()),
                None => eprintln!("Unsupported uplink type: {}", args),
            },

            ("set_tunnel_mode", Role::Master) => match args.parse::<TunnelMode>() {
                Ok(mode) => {
                    self.mode = mode;
                    // Propagate to an already-registered binding
                    if self.registered() {
                        self.relay(self.client.configure_service(&self.username, mode).await)?;
                    }
                }
                Err(_) => eprintln!("Unsupported tunnel mode: {}", args),
            },

            ("get_vtun_parameters", _) => {
                let outcome = self.get_vtun_parameters().await;
                self.relay(outcome)?;
            }

            ("wait_vtun_allowed" | "wait_master_connection", Role::Onsite) => {
                match self.wait_vtun_allowed().await {
                    Ok(true) => {
                        println!("ready");
                        // The device proceeds in a fresh session; this one
                        // keeps its binding alive for it
                        return Ok(LoopAction::Exit { unregister: false });
                    }
                    Ok(false) => eprintln!("not_ready"),
                    Err(e) => self.relay(Err::<(), _>(e))?,
                }
            }

            ("show_online_onsite_devs", Role::Master) => {
                match self.client.online_onsite_devs().await {
                    Ok(devices) => {
                        for device in devices {
                            println!("{}", device);
                        }
                    }
                    Err(e) => self.relay(Err::<(), _>(e))?,
                }
            }

            ("connect_to_onsite_dev", Role::Master) => {
                let outcome = self.connect_to_onsite_dev(args).await;
                self.relay(outcome)?;
            }

            ("drop_vtun", _) => {
                let outcome = self.client.stop_tunnel_server(&self.username).await;
                self.relay(outcome)?;
            }

            _ => eprintln!("Unknown command: {}", line),
        }

        Ok(LoopAction::Continue)
    }

    /// Print a domain error and continue, or bubble up a transport failure.
    fn relay<T>(&self, outcome: Result<T>) -> Result<()> {
        match outcome {
            Ok(_) => Ok(()),
            Err(e) if e.is_session_fatal() => Err(e),
            Err(e) => {
                eprintln!("{}", e);
                Ok(())
            }
        }
    }

    /// The workhorse for both roles: register if needed, start the vtun
    /// server for this binding, print the peer-shell rendering.
    async fn get_vtun_parameters(&mut self) -> Result<()> {
        self.ensure_registered().await?;
        self.client.start_tunnel_server(&self.username).await?;
        let config = self.client.client_shell_config(&self.username).await?;
        println!("{}", config);
        Ok(())
    }

    /// Block until the manager signals that a master has paired with this
    /// onsite device. True on `ready`, false on timeout.
    async fn wait_vtun_allowed(&mut self) -> Result<bool> {
        self.ensure_registered().await?;

        // Subscribe before checking current state so a signal racing the
        // check is not lost
        let listener = EventListener::new(self.client.config().clone());
        let mut events = listener.listen().await?;

        // The pairing may already have been recorded before this shell
        // started waiting
        let marker = format!("<=> {} [", self.username);
        if self
            .client
            .dump_sessions()
            .await?
            .iter()
            .any(|descriptor| descriptor.contains(&marker))
        {
            return Ok(true);
        }

        let deadline = tokio::time::Instant::now() + WAIT_VTUN_TIMEOUT;
        loop {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Some(ManagerEvent::VtunAllowed { username })) if username == self.username => {
                    return Ok(true);
                }
                Ok(Some(_)) => continue,
                Ok(None) => return Ok(false),
                Err(_) => return Ok(false),
            }
        }
    }

    async fn connect_to_onsite_dev(&mut self, onsite_id: &str) -> Result<()> {
        if onsite_id.is_empty() {
            eprintln!("Usage: connect_to_onsite_dev <id>");
            return Ok(());
        }
        self.ensure_registered().await?;
        self.client
            .connect_master_to_onsite(&self.username, onsite_id)
            .await
    }
}

/// Run the REPL until exit/logout/EOF or a session-fatal error.
pub async fn run_loop(state: &mut ShellState) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        stdout
            .write_all(format!("{}$ ", state.username).as_bytes())
            .await?;
        stdout.flush().await?;

        match lines.next_line().await? {
            None => {
                // EOF behaves like exit
                state.unregister_quietly().await;
                return Ok(());
            }
            Some(line) => match state.dispatch(&line).await {
                Ok(LoopAction::Continue) => {}
                Ok(LoopAction::Exit { unregister }) => {
                    if unregister {
                        state.unregister_quietly().await;
                    }
                    return Ok(());
                }
                Err(e) => {
                    eprintln!("Session error: {}", e);
                    return Err(e);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tundev_common::ManagerClientConfig;

    fn state(role: Role) -> (ShellState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("shell.lock");
        let lock = ShellAliveLock::acquire(&lock_path, "dev_a").unwrap();
        // Points at a socket nobody listens on; local commands never dial
        let client = ManagerClient::new(ManagerClientConfig {
            socket_path: Some(dir.path().join("managerd.sock")),
            ..ManagerClientConfig::default()
        })
        .unwrap();
        let state = ShellState::new(
            role,
            "dev_a".to_string(),
            client,
            lock,
            DebugToggle::disabled(),
        );
        (state, dir)
    }

    #[tokio::test]
    async fn setters_validate_and_store_locally() {
        let (mut shell, _dir) = state(Role::Onsite);

        shell
            .dispatch("set_tunnelling_dev_lan_ip_address 192.168.1.2/24")
            .await
            .unwrap();
        assert_eq!(shell.lan_ip, Some("192.168.1.2/24".parse().unwrap()));

        // Invalid input leaves the previous value untouched
        shell
            .dispatch("set_tunnelling_dev_lan_ip_address 999.1.1.1/24")
            .await
            .unwrap();
        assert_eq!(shell.lan_ip, Some("192.168.1.2/24".parse().unwrap()));

        shell
            .dispatch("set_tunnelling_dev_dns_server_list 8.8.8.8 192.168.1.1")
            .await
            .unwrap();
        assert_eq!(shell.lan_dns.len(), 2);
        shell
            .dispatch("set_tunnelling_dev_dns_server_list 8.8.8.8 junk")
            .await
            .unwrap();
        assert_eq!(shell.lan_dns.len(), 2, "bad list must not replace the old one");

        shell
            .dispatch("set_tunnelling_dev_hostname 'plant-floor'")
            .await
            .unwrap();
        assert_eq!(shell.hostname.as_deref(), Some("plant-floor"));

        shell
            .dispatch("set_tunnelling_dev_uplink_type 3g")
            .await
            .unwrap();
        assert_eq!(shell.uplink_type.as_deref(), Some("3g"));
        shell
            .dispatch("set_tunnelling_dev_uplink_type 5g")
            .await
            .unwrap();
        assert_eq!(shell.uplink_type.as_deref(), Some("3g"));
    }

    #[tokio::test]
    async fn role_gated_commands_are_unknown_to_the_other_role() {
        let (mut onsite, _dir) = state(Role::Onsite);
        // set_tunnel_mode belongs to the master shell
        onsite.dispatch("set_tunnel_mode L2").await.unwrap();
        assert_eq!(onsite.mode, TunnelMode::L3);

        let (mut master, _dir2) = state(Role::Master);
        master.dispatch("set_tunnel_mode L2").await.unwrap();
        assert_eq!(master.mode, TunnelMode::L2);
        // ...and an invalid literal is reported, not stored
        master.dispatch("set_tunnel_mode L4").await.unwrap();
        assert_eq!(master.mode, TunnelMode::L2);

        // uplink announcements belong to the onsite shell
        master
            .dispatch("set_tunnelling_dev_uplink_type lan")
            .await
            .unwrap();
        assert_eq!(master.uplink_type, None);
    }

    #[tokio::test]
    async fn exit_and_logout_leave_with_unregister() {
        let (mut shell, _dir) = state(Role::Master);
        assert_eq!(
            shell.dispatch("exit").await.unwrap(),
            LoopAction::Exit { unregister: true }
        );
        assert_eq!(
            shell.dispatch("logout").await.unwrap(),
            LoopAction::Exit { unregister: true }
        );
    }

    #[tokio::test]
    async fn blank_and_unknown_lines_continue() {
        let (mut shell, _dir) = state(Role::Onsite);
        assert_eq!(shell.dispatch("").await.unwrap(), LoopAction::Continue);
        assert_eq!(
            shell.dispatch("frobnicate now").await.unwrap(),
            LoopAction::Continue
        );
    }
}
