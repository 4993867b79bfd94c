//! Running show commands over SSH.
//!
//! The transport drives the OpenSSH client as a child process: the argv is
//! assembled as a vector, never through a shell, and the host-key policy
//! is expressed through explicit client options. A production run verifies
//! against the managed known-hosts file and never records new keys; the
//! setup mode accepts and records keys and is flagged in every log line.

use std::process::Stdio;
use log::{debug, warn};
use tokio::io::AsyncReadExt;
use tokio::process::Command as AsyncCommand;
use crate::config::SshConf;
use super::{CollectFailure, DeviceInfo};


//------------ Constants -----------------------------------------------------

/// The one show command the collector ever runs.
///
/// No user-supplied text reaches the session.
const SHOW_BGP_COMMAND: &str =
    "show configuration protocols bgp \
     | display inheritance no-comments | no-more";


//------------ SshCommand ----------------------------------------------------

/// The prepared command for collecting from a device.
#[derive(Clone, Debug)]
pub struct SshCommand {
    /// The SSH configuration.
    conf: SshConf,
}

impl SshCommand {
    /// Creates a new command from the configuration.
    pub fn new(conf: &SshConf) -> Self {
        SshCommand { conf: conf.clone() }
    }

    /// Retrieves the BGP configuration from the given device.
    ///
    /// Opens a connection, runs the fixed show command, and closes. On
    /// failure returns the failure kind plus a detail string suitable for
    /// the per-device result record.
    pub fn fetch_bgp_config(
        &self,
        device: &DeviceInfo,
    ) -> Result<String, (CollectFailure, String)> {
        if self.conf.setup_mode {
            warn!(
                "{}: SETUP MODE connection, host key will be \
                 accepted and recorded.",
                device.hostname
            );
        }
        let command = self.build_command(device);
        self.run(device, command)
    }

    /// Assembles the argv for the given device.
    fn build_command(&self, device: &DeviceInfo) -> AsyncCommand {
        let mut args: Vec<String> = Vec::new();
        let use_password =
            self.conf.password.is_some() && self.conf.key_path.is_none();

        let mut command = if use_password {
            // sshpass feeds the password through the environment; its
            // presence in a deployment is what permits password
            // authentication at all.
            warn!(
                "{}: using password authentication. This is not \
                 recommended for production use.",
                device.hostname
            );
            let mut command = AsyncCommand::new("sshpass");
            args.push("-e".into());
            args.push("ssh".into());
            if let Some(password) = self.conf.password.as_ref() {
                command.env("SSHPASS", password);
            }
            command
        }
        else {
            AsyncCommand::new("ssh")
        };

        args.push("-p".into());
        args.push(device.port.to_string());
        args.push("-o".into());
        args.push("BatchMode=yes".into());
        args.push("-o".into());
        args.push(format!(
            "ConnectTimeout={}", self.conf.connect_timeout.as_secs()
        ));
        args.push("-o".into());
        if self.conf.setup_mode {
            args.push("StrictHostKeyChecking=accept-new".into());
        }
        else {
            args.push("StrictHostKeyChecking=yes".into());
        }
        args.push("-o".into());
        args.push(format!(
            "UserKnownHostsFile={}",
            self.conf.known_hosts_file.display()
        ));
        if let Some(key) = self.conf.key_path.as_ref() {
            args.push("-i".into());
            args.push(key.display().to_string());
        }
        args.push(format!("{}@{}", self.conf.username, device.address));
        args.push(SHOW_BGP_COMMAND.into());

        command.args(&args);
        command
    }

    /// Actually runs the SSH command.
    fn run(
        &self,
        device: &DeviceInfo,
        mut command: AsyncCommand,
    ) -> Result<String, (CollectFailure, String)> {
        // Because we can’t have a timeout on a child process with just std,
        // we resort to Tokio here: We fire up a current-thread runtime and
        // use Tokio’s async process handling.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(|err| (
                CollectFailure::Unknown,
                format!("failed to create runtime: {}", err)
            ))?;

        // The overall budget covers connecting plus running the command.
        let budget = self.conf.connect_timeout
            + self.conf.command_timeout;

        runtime.block_on(async {
            command.stdin(Stdio::null());
            command.stdout(Stdio::piped());
            command.stderr(Stdio::piped());
            command.kill_on_drop(true);
            let mut child = command.spawn().map_err(|err| (
                CollectFailure::Transport,
                format!("failed to spawn ssh: {}", err)
            ))?;
            let mut stdout_pipe =
                child.stdout.take().expect("piped stdout");
            let mut stderr_pipe =
                child.stderr.take().expect("piped stderr");

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let waited = tokio::time::timeout(budget, async {
                let status = child.wait();
                tokio::try_join!(
                    status,
                    stdout_pipe.read_to_end(&mut stdout),
                    stderr_pipe.read_to_end(&mut stderr),
                )
            }).await;

            let status = match waited {
                Ok(Ok((status, _, _))) => status,
                Ok(Err(err)) => {
                    return Err((
                        CollectFailure::Transport,
                        format!("waiting for ssh failed: {}", err)
                    ))
                }
                Err(_) => {
                    if let Err(err) = child.kill().await {
                        warn!(
                            "{}: failed to kill ssh process: {}",
                            device.hostname, err
                        );
                    }
                    return Err((
                        CollectFailure::CommandTimeout,
                        format!(
                            "command did not complete within {}s",
                            budget.as_secs()
                        )
                    ))
                }
            };

            let stderr = String::from_utf8_lossy(&stderr).into_owned();
            if status.success() {
                debug!("{}: ssh completed.", device.hostname);
                String::from_utf8(stdout).map_err(|_| (
                    CollectFailure::Unknown,
                    "command output was not valid UTF-8".into()
                ))
            }
            else {
                Err((
                    classify_ssh_failure(&stderr),
                    first_relevant_line(&stderr)
                ))
            }
        })
    }
}


//------------ Failure classification ----------------------------------------

/// Classifies an SSH failure from the client’s stderr.
fn classify_ssh_failure(stderr: &str) -> CollectFailure {
    if stderr.contains("REMOTE HOST IDENTIFICATION HAS CHANGED") {
        CollectFailure::HostKeyMismatch
    }
    else if stderr.contains("Host key verification failed")
        || stderr.contains("No ED25519 host key is known")
        || stderr.contains("No RSA host key is known")
    {
        CollectFailure::HostKeyUnknown
    }
    else if stderr.contains("Permission denied")
        || stderr.contains("Too many authentication failures")
    {
        CollectFailure::AuthFailed
    }
    else if stderr.contains("timed out")
        || stderr.contains("Operation timed out")
    {
        CollectFailure::ConnectTimeout
    }
    else if stderr.contains("No route to host")
        || stderr.contains("Connection refused")
        || stderr.contains("Connection closed")
        || stderr.contains("Connection reset")
        || stderr.contains("Could not resolve hostname")
    {
        CollectFailure::Transport
    }
    else {
        CollectFailure::Unknown
    }
}

/// Picks the first non-empty stderr line as the failure detail.
fn first_relevant_line(stderr: &str) -> String {
    stderr.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("ssh exited unsuccessfully")
        .into()
}

//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn conf() -> SshConf {
        SshConf {
            username: "otto-bgp".into(),
            key_path: Some(PathBuf::from("/etc/otto-bgp/id_ed25519")),
            password: None,
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(60),
            max_workers: 5,
            known_hosts_file: PathBuf::from(
                "/var/lib/otto-bgp/ssh-keys/known_hosts"
            ),
            setup_mode: false,
        }
    }

    #[test]
    fn classifies_stderr() {
        assert_eq!(
            classify_ssh_failure(
                "otto@r1: Permission denied (publickey)."
            ),
            CollectFailure::AuthFailed
        );
        assert_eq!(
            classify_ssh_failure(
                "@@@@\nWARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!\n"
            ),
            CollectFailure::HostKeyMismatch
        );
        assert_eq!(
            classify_ssh_failure(
                "Host key verification failed."
            ),
            CollectFailure::HostKeyUnknown
        );
        assert_eq!(
            classify_ssh_failure(
                "ssh: connect to host 192.0.2.1 port 22: \
                 Connection timed out"
            ),
            CollectFailure::ConnectTimeout
        );
        assert_eq!(
            classify_ssh_failure(
                "ssh: connect to host 192.0.2.1 port 22: \
                 Connection refused"
            ),
            CollectFailure::Transport
        );
        assert_eq!(
            classify_ssh_failure("something odd"),
            CollectFailure::Unknown
        );
    }

    #[test]
    fn detail_is_first_line() {
        assert_eq!(
            first_relevant_line("\n\nPermission denied\nmore\n"),
            "Permission denied"
        );
        assert_eq!(
            first_relevant_line(""),
            "ssh exited unsuccessfully"
        );
    }

    #[test]
    fn strict_mode_never_accepts_new_keys() {
        let command = SshCommand::new(&conf());
        let device = DeviceInfo::from_address("192.0.2.1");
        let argv = format!(
            "{:?}",
            command.build_command(&device).as_std()
        );
        assert!(argv.contains("StrictHostKeyChecking=yes"));
        assert!(!argv.contains("accept-new"));
        assert!(argv.contains("BatchMode=yes"));
        assert!(argv.contains(SHOW_BGP_COMMAND));
    }

    #[test]
    fn setup_mode_accepts_and_records() {
        let mut conf = conf();
        conf.setup_mode = true;
        let command = SshCommand::new(&conf);
        let device = DeviceInfo::from_address("192.0.2.1");
        let argv = format!(
            "{:?}",
            command.build_command(&device).as_std()
        );
        assert!(argv.contains("StrictHostKeyChecking=accept-new"));
    }
}
