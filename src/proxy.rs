//! SSH tunnels to IRR servers.
//!
//! Some deployments cannot reach the IRR servers directly and instead
//! forward the whois port through a jump host. The proxy manager owns one
//! `ssh -N -L` child per configured tunnel, probes tunnel health by
//! connecting to the local port, and reconnects with exponential backoff.
//! Generation rewrites its bgpq4 argv to point at the local endpoints.

use std::net::{SocketAddr, TcpStream};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use log::{debug, error, info, warn};
use crate::config::{IrrProxyConf, TunnelConf};
use crate::error::Failed;
use crate::utils::sync::Mutex;


//------------ Constants -----------------------------------------------------

/// Initial reconnect backoff.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Maximum reconnect backoff.
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Timeout for a single health probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// How long to wait for a freshly spawned tunnel to become healthy.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);


//------------ ProxyUnavailable ----------------------------------------------

/// A required tunnel is not available.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProxyUnavailable {
    /// The name of the tunnel concerned.
    pub tunnel: String,

    /// A human-readable reason.
    pub reason: String,
}


//------------ ProxyManager --------------------------------------------------

/// Maintains the configured IRR tunnels.
///
/// Dropping the manager kills all tunnel children.
#[derive(Debug)]
pub struct ProxyManager {
    /// The proxy configuration.
    conf: IrrProxyConf,

    /// Per-tunnel state.
    tunnels: Vec<Tunnel>,
}

impl ProxyManager {
    /// Creates a manager if the proxy is enabled in the configuration.
    pub fn new(conf: &IrrProxyConf) -> Option<Self> {
        if !conf.enabled {
            return None
        }
        Some(ProxyManager {
            conf: conf.clone(),
            tunnels: conf.tunnels.iter().map(|tunnel| {
                Tunnel::new(tunnel.clone())
            }).collect(),
        })
    }

    /// Starts all tunnels and waits for them to become healthy.
    pub fn start(&self) -> Result<(), Failed> {
        let timeout = self.conf.connection_timeout
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        for tunnel in &self.tunnels {
            tunnel.spawn(&self.conf)?;
            if !tunnel.await_healthy(timeout) {
                error!(
                    "IRR tunnel '{}' did not become healthy within {}s.",
                    tunnel.conf.name, timeout.as_secs()
                );
                return Err(Failed)
            }
            info!(
                "IRR tunnel '{}' to {}:{} is up on local port {}.",
                tunnel.conf.name, tunnel.conf.remote_host,
                tunnel.conf.remote_port, tunnel.conf.local_port
            );
        }
        Ok(())
    }

    /// Returns whether a direct fallback is allowed when a tunnel is down.
    pub fn allow_direct_fallback(&self) -> bool {
        self.conf.allow_direct_fallback
    }

    /// Rewrites a bgpq4 argv to loop through the tunnel for `irr_server`.
    ///
    /// The value following `-h` is replaced with the local endpoint. If no
    /// tunnel is configured for the server or the tunnel is down and
    /// cannot be revived, an error is returned and the caller decides
    /// whether a direct connection is acceptable.
    pub fn wrap_bgpq4_args(
        &self,
        args: &[String],
        irr_server: &str,
    ) -> Result<Vec<String>, ProxyUnavailable> {
        let tunnel = match self.tunnels.iter().find(|tunnel| {
            tunnel.conf.remote_host == irr_server
                || tunnel.conf.name == irr_server
        }) {
            Some(tunnel) => tunnel,
            None => {
                return Err(ProxyUnavailable {
                    tunnel: irr_server.into(),
                    reason: "no tunnel configured for server".into(),
                })
            }
        };
        tunnel.ensure_healthy(&self.conf)?;

        let local = format!("127.0.0.1:{}", tunnel.conf.local_port);
        let mut res = Vec::with_capacity(args.len());
        let mut replace_next = false;
        for arg in args {
            if replace_next {
                res.push(local.clone());
                replace_next = false;
            }
            else if arg == "-h" {
                res.push(arg.clone());
                replace_next = true;
            }
            else {
                res.push(arg.clone());
            }
        }
        Ok(res)
    }
}

impl Drop for ProxyManager {
    fn drop(&mut self) {
        for tunnel in &self.tunnels {
            tunnel.shutdown();
        }
    }
}


//------------ Tunnel --------------------------------------------------------

/// A single managed tunnel.
#[derive(Debug)]
struct Tunnel {
    /// The tunnel definition.
    conf: TunnelConf,

    /// The mutable tunnel state.
    state: Mutex<TunnelState>,
}

/// The mutable state of a tunnel.
#[derive(Debug, Default)]
struct TunnelState {
    /// The running ssh child, if any.
    child: Option<Child>,

    /// The current reconnect backoff.
    backoff: Option<Duration>,

    /// Earliest time for the next reconnect attempt.
    next_attempt: Option<Instant>,
}

impl Tunnel {
    /// Creates a new, not yet started tunnel.
    fn new(conf: TunnelConf) -> Self {
        Tunnel { conf, state: Mutex::new(TunnelState::default()) }
    }

    /// Spawns the ssh child for this tunnel.
    fn spawn(&self, proxy: &IrrProxyConf) -> Result<(), Failed> {
        let jump_host = match proxy.jump_host.as_ref() {
            Some(host) => host,
            None => {
                error!("IRR proxy has no jump host configured.");
                return Err(Failed)
            }
        };
        let mut command = Command::new("ssh");
        command
            .arg("-N")
            .arg("-L")
            .arg(format!(
                "{}:{}:{}",
                self.conf.local_port,
                self.conf.remote_host,
                self.conf.remote_port
            ))
            .arg("-o").arg("BatchMode=yes")
            .arg("-o").arg("StrictHostKeyChecking=yes")
            .arg("-o").arg("ExitOnForwardFailure=yes")
            .arg("-o").arg("ServerAliveInterval=30");
        if let Some(known_hosts) = proxy.known_hosts_file.as_ref() {
            command.arg("-o").arg(format!(
                "UserKnownHostsFile={}", known_hosts.display()
            ));
        }
        if let Some(key) = proxy.ssh_key_file.as_ref() {
            command.arg("-i").arg(key);
        }
        match proxy.jump_user.as_ref() {
            Some(user) => {
                command.arg(format!("{}@{}", user, jump_host));
            }
            None => {
                command.arg(jump_host);
            }
        }
        command.stdin(Stdio::null());
        command.stdout(Stdio::null());
        command.stderr(Stdio::null());

        match command.spawn() {
            Ok(child) => {
                debug!(
                    "Spawned IRR tunnel '{}' (PID {}).",
                    self.conf.name, child.id()
                );
                self.state.lock().child = Some(child);
                Ok(())
            }
            Err(err) => {
                error!(
                    "Failed to spawn ssh for IRR tunnel '{}': {}",
                    self.conf.name, err
                );
                Err(Failed)
            }
        }
    }

    /// Waits for the tunnel to accept connections.
    fn await_healthy(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.probe() {
                self.state.lock().backoff = None;
                return true
            }
            std::thread::sleep(Duration::from_millis(250));
        }
        false
    }

    /// Probes the local endpoint once.
    fn probe(&self) -> bool {
        let addr: SocketAddr = ([127, 0, 0, 1], self.conf.local_port).into();
        TcpStream::connect_timeout(&addr, PROBE_TIMEOUT).is_ok()
    }

    /// Makes sure the tunnel is healthy, reconnecting if necessary.
    fn ensure_healthy(
        &self, proxy: &IrrProxyConf
    ) -> Result<(), ProxyUnavailable> {
        if self.probe() {
            self.state.lock().backoff = None;
            return Ok(())
        }

        // The tunnel is down. Reap a dead child and decide whether the
        // backoff allows another attempt now.
        {
            let mut state = self.state.lock();
            if let Some(child) = state.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    warn!(
                        "IRR tunnel '{}' exited with {}.",
                        self.conf.name, status
                    );
                    state.child = None;
                }
            }
            if let Some(next) = state.next_attempt {
                if Instant::now() < next {
                    return Err(ProxyUnavailable {
                        tunnel: self.conf.name.clone(),
                        reason: "tunnel down, in reconnect backoff".into(),
                    })
                }
            }
            let backoff = match state.backoff {
                Some(backoff) => BACKOFF_CAP.min(backoff * 2),
                None => BACKOFF_BASE,
            };
            state.backoff = Some(backoff);
            state.next_attempt = Some(Instant::now() + backoff);
            if let Some(mut child) = state.child.take() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }

        if self.spawn(proxy).is_err() {
            return Err(ProxyUnavailable {
                tunnel: self.conf.name.clone(),
                reason: "failed to respawn tunnel".into(),
            })
        }
        let timeout = proxy.connection_timeout
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        if self.await_healthy(timeout) {
            info!("IRR tunnel '{}' reconnected.", self.conf.name);
            Ok(())
        }
        else {
            Err(ProxyUnavailable {
                tunnel: self.conf.name.clone(),
                reason: "tunnel did not come back up".into(),
            })
        }
    }

    /// Kills the tunnel child if it is running.
    fn shutdown(&self) {
        let mut state = self.state.lock();
        if let Some(mut child) = state.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;

    fn manager_with_tunnel(local_port: u16) -> ProxyManager {
        let conf = IrrProxyConf {
            enabled: true,
            jump_host: Some("bastion.example.net".into()),
            jump_user: Some("otto".into()),
            ssh_key_file: None,
            known_hosts_file: None,
            connection_timeout: None,
            allow_direct_fallback: false,
            tunnels: vec![
                TunnelConf {
                    name: "radb".into(),
                    local_port,
                    remote_host: "whois.radb.net".into(),
                    remote_port: 43,
                }
            ],
        };
        ProxyManager::new(&conf).unwrap()
    }

    #[test]
    fn disabled_proxy_yields_no_manager() {
        assert!(ProxyManager::new(&IrrProxyConf::default()).is_none());
    }

    #[test]
    fn unknown_server_is_unavailable() {
        let manager = manager_with_tunnel(43001);
        let args = vec!["-h".to_string(), "whois.ripe.net".to_string()];
        let err = manager.wrap_bgpq4_args(&args, "whois.ripe.net")
            .unwrap_err();
        assert!(err.reason.contains("no tunnel"));
    }

    #[test]
    fn argv_rewrite_replaces_host() {
        // A listener of our own on the local port makes the health probe
        // pass without a real tunnel.
        let listener = std::net::TcpListener::bind(
            ("127.0.0.1", 0)
        ).unwrap();
        let port = listener.local_addr().unwrap().port();
        let manager = manager_with_tunnel(port);
        let args: Vec<String> = [
            "-4", "-l", "AS13335", "-h", "whois.radb.net", "AS13335"
        ].iter().map(|s| s.to_string()).collect();
        let wrapped = manager
            .wrap_bgpq4_args(&args, "whois.radb.net")
            .unwrap();
        let expected: Vec<String> = vec![
            "-4".into(), "-l".into(), "AS13335".into(),
            "-h".into(), format!("127.0.0.1:{}", port), "AS13335".into(),
        ];
        assert_eq!(wrapped, expected);
        drop(listener);
    }
}
