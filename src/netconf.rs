//! Applying configuration over NETCONF.
//!
//! The applier drives a Junos NETCONF session through the SSH `netconf`
//! subsystem: an OpenSSH child process with RPCs framed by the classic
//! `]]>]]>` delimiter. The session is an explicit state machine; commits
//! use the confirmed-commit extension so the router rolls itself back if
//! we never confirm, and the applier never tries to recover by
//! re-committing after a failure.
//!
//! The RPC surface needed here is a handful of fixed Junos requests, so
//! the payloads are assembled and inspected as text.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout};
use crate::audit::{AuditEvent, AuditLog};
use crate::config::{Mode, NetconfConf};
use crate::utils::sync::Cancel;


//------------ ApplierState --------------------------------------------------

/// The state of the per-router apply state machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq,
    serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplierState {
    Idle,
    Connected,
    Loaded,
    Previewed,
    CommittedConfirmed,
    Confirmed,
    RolledBack,
}

impl fmt::Display for ApplierState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            ApplierState::Idle => "idle",
            ApplierState::Connected => "connected",
            ApplierState::Loaded => "loaded",
            ApplierState::Previewed => "previewed",
            ApplierState::CommittedConfirmed => "committed_confirmed",
            ApplierState::Confirmed => "confirmed",
            ApplierState::RolledBack => "rolled_back",
        })
    }
}


//------------ ApplyError ----------------------------------------------------

/// Why an apply failed.
#[derive(Clone, Debug)]
pub enum ApplyError {
    /// The NETCONF session could not be established.
    Connect(String),

    /// An RPC failed or returned an error.
    Rpc(String),

    /// An RPC exceeded the operation timeout.
    Timeout,

    /// The health check failed after the confirmed commit.
    HealthCheck(String),
}

impl fmt::Display for ApplyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ApplyError::Connect(detail) => {
                write!(f, "NETCONF connect failed: {}", detail)
            }
            ApplyError::Rpc(detail) => {
                write!(f, "NETCONF RPC failed: {}", detail)
            }
            ApplyError::Timeout => {
                f.write_str("NETCONF_TIMEOUT")
            }
            ApplyError::HealthCheck(detail) => {
                write!(f, "health check failed: {}", detail)
            }
        }
    }
}


//------------ ApplyReport ---------------------------------------------------

/// The outcome of applying to one router.
#[derive(Clone, Debug)]
pub struct ApplyReport {
    /// The router concerned.
    pub hostname: String,

    /// The final state of the state machine.
    pub state: ApplierState,

    /// The preview diff, when one was computed.
    pub diff: Option<String>,

    /// Detail on the outcome.
    pub detail: String,
}

impl ApplyReport {
    /// Returns whether the apply finished in a confirmed state.
    pub fn confirmed(&self) -> bool {
        self.state == ApplierState::Confirmed
    }
}


//------------ NetconfApplier ------------------------------------------------

/// Applies configuration payloads to routers.
pub struct NetconfApplier<'a> {
    conf: &'a NetconfConf,
    mode: Mode,
    audit: &'a AuditLog,
}

impl<'a> NetconfApplier<'a> {
    /// Creates a new applier.
    pub fn new(
        conf: &'a NetconfConf, mode: Mode, audit: &'a AuditLog
    ) -> Self {
        NetconfApplier { conf, mode, audit }
    }

    /// Applies a payload to one router.
    ///
    /// `confirmed_by_operator` reports whether the run already carries
    /// the operator’s go-ahead; in system mode an apply without it stops
    /// after the preview and returns the diff for inspection.
    pub fn apply(
        &self,
        hostname: &str,
        address: &str,
        payload: &str,
        confirmed_by_operator: bool,
        cancel: &Cancel,
    ) -> ApplyReport {
        self.event(hostname, "apply.started", "ok", String::new());

        let mut session = match NetconfSession::open(
            self.conf, address
        ) {
            Ok(session) => session,
            Err(err) => {
                // Nothing was changed; the no-op outcome still lands in
                // the rolled-back state so callers see a terminal state.
                self.event(
                    hostname, "apply.connect_failed", "failed",
                    err.to_string()
                );
                return ApplyReport {
                    hostname: hostname.into(),
                    state: ApplierState::RolledBack,
                    diff: None,
                    detail: err.to_string(),
                }
            }
        };
        let mut state = ApplierState::Connected;
        self.event(hostname, "apply.connected", "ok", String::new());

        match self.drive(
            hostname, &mut session, payload,
            confirmed_by_operator, cancel, &mut state
        ) {
            Ok(report) => report,
            Err(err) => {
                let final_state = self.unwind(
                    hostname, &mut session, state, &err
                );
                ApplyReport {
                    hostname: hostname.into(),
                    state: final_state,
                    diff: None,
                    detail: err.to_string(),
                }
            }
        }
    }

    /// Runs the state machine past the connect.
    fn drive(
        &self,
        hostname: &str,
        session: &mut NetconfSession,
        payload: &str,
        confirmed_by_operator: bool,
        cancel: &Cancel,
        state: &mut ApplierState,
    ) -> Result<ApplyReport, ApplyError> {
        session.load_configuration(payload)?;
        *state = ApplierState::Loaded;
        self.event(hostname, "apply.loaded", "ok", String::new());

        let diff = session.preview_diff()?;
        *state = ApplierState::Previewed;
        if diff.trim().is_empty() {
            // Nothing to commit. The state machine short-circuits to
            // confirmed without ever committing.
            session.discard_changes()?;
            session.close();
            *state = ApplierState::Confirmed;
            self.event(
                hostname, "apply.no_change", "ok",
                "empty diff, nothing committed".into()
            );
            return Ok(ApplyReport {
                hostname: hostname.into(),
                state: *state,
                diff: Some(diff),
                detail: "no changes".into(),
            })
        }
        self.event(
            hostname, "apply.previewed", "ok",
            format!("{} diff lines", diff.lines().count())
        );

        if self.mode == Mode::System && !confirmed_by_operator {
            session.discard_changes()?;
            session.close();
            self.event(
                hostname, "apply.awaiting_confirmation", "skipped",
                "manual confirmation required".into()
            );
            return Ok(ApplyReport {
                hostname: hostname.into(),
                state: *state,
                diff: Some(diff),
                detail: "awaiting operator confirmation".into(),
            })
        }

        if cancel.is_tripped() {
            session.discard_changes()?;
            session.close();
            self.event(
                hostname, "apply.canceled", "skipped",
                "cancellation before commit".into()
            );
            return Ok(ApplyReport {
                hostname: hostname.into(),
                state: ApplierState::RolledBack,
                diff: Some(diff),
                detail: "canceled before commit".into(),
            })
        }

        let minutes = self.conf.confirmed_commit_minutes;
        let comment = format!(
            "{} automated prefix-list update",
            self.conf.commit_comment_prefix
        );
        session.commit_confirmed(minutes, &comment)?;
        *state = ApplierState::CommittedConfirmed;
        self.event(
            hostname, "apply.committed_confirmed", "ok",
            format!("rollback timer {} minutes", minutes)
        );

        self.health_check(hostname, session)?;

        session.commit(&format!(
            "{} confirm", self.conf.commit_comment_prefix
        ))?;
        *state = ApplierState::Confirmed;
        self.event(hostname, "apply.confirmed", "ok", String::new());
        session.close();

        Ok(ApplyReport {
            hostname: hostname.into(),
            state: *state,
            diff: Some(diff),
            detail: "confirmed".into(),
        })
    }

    /// Runs the post-commit health probes.
    ///
    /// In autonomous mode every probe must pass; in system mode a
    /// failing probe is logged but does not stop confirmation.
    fn health_check(
        &self, hostname: &str, session: &mut NetconfSession
    ) -> Result<(), ApplyError> {
        for (name, rpc) in HEALTH_PROBES {
            match session.rpc(rpc) {
                Ok(_) => {
                    debug!("{}: health probe '{}' passed.", hostname, name);
                }
                Err(err) => {
                    if self.mode.is_autonomous() {
                        return Err(ApplyError::HealthCheck(format!(
                            "probe '{}': {}", name, err
                        )))
                    }
                    warn!(
                        "{}: health probe '{}' failed: {}",
                        hostname, name, err
                    );
                }
            }
        }
        Ok(())
    }

    /// Handles a failure according to the state it happened in.
    ///
    /// Before the commit the candidate is discarded. After a confirmed
    /// commit the router owns the rollback timer; the applier leaves the
    /// timer to fire rather than attempting any recovery.
    fn unwind(
        &self,
        hostname: &str,
        session: &mut NetconfSession,
        state: ApplierState,
        err: &ApplyError,
    ) -> ApplierState {
        match state {
            ApplierState::CommittedConfirmed => {
                error!(
                    "{}: {} after confirmed commit; leaving rollback \
                     timer to expire.",
                    hostname, err
                );
                self.event(
                    hostname, "apply.rolled_back", "failed",
                    format!("reason=timer: {}", err)
                );
            }
            _ => {
                let _ = session.discard_changes();
                self.event(
                    hostname, "apply.rolled_back", "failed",
                    err.to_string()
                );
            }
        }
        session.close();
        ApplierState::RolledBack
    }

    /// Emits an audit event for this applier.
    fn event(
        &self, hostname: &str, event: &str, outcome: &str, detail: String
    ) {
        self.audit.record(
            AuditEvent::new(event, outcome, detail).router(hostname)
        );
    }
}

/// The post-commit health probes.
///
/// Read-only operational RPCs; a probe passes if the RPC comes back
/// without an error element.
const HEALTH_PROBES: &[(&str, &str)] = &[
    ("bgp-summary", "<get-bgp-summary-information/>"),
    ("system-uptime", "<get-system-uptime-information/>"),
];


//------------ NetconfSession ------------------------------------------------

/// The NETCONF framing delimiter.
const FRAME_END: &str = "]]>]]>";

/// Our hello message.
const HELLO: &str = "\
<hello xmlns=\"urn:ietf:params:xml:ns:netconf:base:1.0\">\n\
  <capabilities>\n\
    <capability>urn:ietf:params:netconf:base:1.0</capability>\n\
  </capabilities>\n\
</hello>\n\
]]>]]>\n";

/// A NETCONF session over the SSH subsystem.
///
/// The session owns a current-thread runtime; every RPC is one
/// write-then-read-until-delimiter exchange under the configured
/// timeout.
struct NetconfSession {
    runtime: tokio::runtime::Runtime,
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    timeout: Duration,
    buffer: Vec<u8>,
}

impl NetconfSession {
    /// Opens a session to the given address.
    fn open(
        conf: &NetconfConf, address: &str
    ) -> Result<Self, ApplyError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(|err| ApplyError::Connect(
                format!("failed to create runtime: {}", err)
            ))?;

        let mut command = tokio::process::Command::new("ssh");
        command
            .arg("-p").arg(conf.port.to_string())
            .arg("-o").arg("BatchMode=yes")
            .arg("-o").arg(format!(
                "ConnectTimeout={}", conf.timeout.as_secs()
            ))
            .arg("-o").arg("StrictHostKeyChecking=yes");
        if let Some(key) = conf.key_path.as_ref() {
            command.arg("-i").arg(key);
        }
        command
            .arg("-s")
            .arg(format!("{}@{}", conf.username, address))
            .arg("netconf");
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::null());
        command.kill_on_drop(true);

        let mut child = runtime.block_on(async {
            command.spawn()
        }).map_err(|err| ApplyError::Connect(
            format!("failed to spawn ssh: {}", err)
        ))?;
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");

        let mut session = NetconfSession {
            runtime,
            child,
            stdin,
            stdout,
            timeout: conf.timeout,
            buffer: Vec::new(),
        };

        // Exchange hellos. The server speaks first.
        let hello = session.read_frame()?;
        if !hello.contains("<hello") {
            session.close();
            return Err(ApplyError::Connect(
                "peer did not send a NETCONF hello".into()
            ))
        }
        session.write_raw(HELLO)?;
        info!("NETCONF session to {} established.", address);
        Ok(session)
    }

    /// Sends an RPC and returns the reply body.
    ///
    /// A reply containing an `<rpc-error>` element with severity error
    /// is turned into an [`ApplyError::Rpc`].
    fn rpc(&mut self, body: &str) -> Result<String, ApplyError> {
        let frame = format!(
            "<rpc>{}</rpc>\n{}\n", body, FRAME_END
        );
        self.write_raw(&frame)?;
        let reply = self.read_frame()?;
        if let Some(message) = rpc_error_message(&reply) {
            return Err(ApplyError::Rpc(message))
        }
        Ok(reply)
    }

    /// Loads a text payload into the candidate configuration.
    fn load_configuration(
        &mut self, payload: &str
    ) -> Result<(), ApplyError> {
        let body = format!(
            "<load-configuration action=\"merge\" format=\"text\">\
             <configuration-text>{}</configuration-text>\
             </load-configuration>",
            escape_xml(payload)
        );
        self.rpc(&body).map(|_| ())
    }

    /// Returns the textual diff of the candidate against the running
    /// configuration.
    fn preview_diff(&mut self) -> Result<String, ApplyError> {
        let reply = self.rpc(
            "<get-configuration compare=\"rollback\" rollback=\"0\" \
             format=\"text\"/>"
        )?;
        Ok(extract_element_text(&reply, "configuration-information")
            .or_else(|| {
                extract_element_text(&reply, "configuration-output")
            })
            .unwrap_or_default())
    }

    /// Commits the candidate with automatic rollback.
    fn commit_confirmed(
        &mut self, minutes: u8, comment: &str
    ) -> Result<(), ApplyError> {
        let body = format!(
            "<commit-configuration><confirmed/>\
             <confirm-timeout>{}</confirm-timeout>\
             <log>{}</log></commit-configuration>",
            minutes, escape_xml(comment)
        );
        self.rpc(&body).map(|_| ())
    }

    /// Commits the candidate, finalizing a confirmed commit.
    fn commit(&mut self, comment: &str) -> Result<(), ApplyError> {
        let body = format!(
            "<commit-configuration><log>{}</log>\
             </commit-configuration>",
            escape_xml(comment)
        );
        self.rpc(&body).map(|_| ())
    }

    /// Discards the candidate configuration.
    fn discard_changes(&mut self) -> Result<(), ApplyError> {
        self.rpc("<discard-changes/>").map(|_| ())
    }

    /// Closes the session, terminating the child.
    fn close(&mut self) {
        let _ = self.write_raw(
            "<rpc><close-session/></rpc>\n]]>]]>\n"
        );
        let child = &mut self.child;
        let runtime = &self.runtime;
        runtime.block_on(async {
            if tokio::time::timeout(
                Duration::from_secs(2), child.wait()
            ).await.is_err() {
                let _ = child.kill().await;
            }
        });
    }

    /// Writes raw bytes to the session.
    fn write_raw(&mut self, data: &str) -> Result<(), ApplyError> {
        let stdin = &mut self.stdin;
        let timeout = self.timeout;
        self.runtime.block_on(async {
            match tokio::time::timeout(timeout, async {
                stdin.write_all(data.as_bytes()).await?;
                stdin.flush().await
            }).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(ApplyError::Rpc(
                    format!("write failed: {}", err)
                )),
                Err(_) => Err(ApplyError::Timeout),
            }
        })
    }

    /// Reads until the framing delimiter.
    fn read_frame(&mut self) -> Result<String, ApplyError> {
        let stdout = &mut self.stdout;
        let timeout = self.timeout;
        let buffer = &mut self.buffer;
        self.runtime.block_on(async {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                if let Some(pos) = find_subsequence(
                    buffer, FRAME_END.as_bytes()
                ) {
                    let frame: Vec<u8> =
                        buffer.drain(..pos + FRAME_END.len()).collect();
                    let text = String::from_utf8_lossy(
                        &frame[..frame.len() - FRAME_END.len()]
                    ).into_owned();
                    return Ok(text)
                }
                let mut chunk = [0u8; 4096];
                let read = tokio::time::timeout_at(
                    deadline, stdout.read(&mut chunk)
                ).await;
                match read {
                    Ok(Ok(0)) => {
                        return Err(ApplyError::Rpc(
                            "session closed by peer".into()
                        ))
                    }
                    Ok(Ok(n)) => buffer.extend_from_slice(&chunk[..n]),
                    Ok(Err(err)) => {
                        return Err(ApplyError::Rpc(
                            format!("read failed: {}", err)
                        ))
                    }
                    Err(_) => return Err(ApplyError::Timeout),
                }
            }
        })
    }
}


//------------ XML helpers ---------------------------------------------------

/// Escapes text for embedding in an XML element.
fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Extracts the error message of an `<rpc-error>` element, if present.
///
/// Junos marks warnings with a severity of `warning`; only severity
/// `error` counts as a failure.
fn rpc_error_message(reply: &str) -> Option<String> {
    let mut search = 0;
    while let Some(start) = reply[search..].find("<rpc-error>") {
        let start = search + start;
        let end = reply[start..].find("</rpc-error>")
            .map(|end| start + end)
            .unwrap_or(reply.len());
        let element = &reply[start..end];
        let severity = extract_element_text(element, "error-severity")
            .unwrap_or_else(|| "error".into());
        if severity.trim() == "error" {
            let message = extract_element_text(element, "error-message")
                .unwrap_or_else(|| "unspecified RPC error".into());
            return Some(message.trim().to_string())
        }
        search = end;
    }
    None
}

/// Extracts the text content of the first occurrence of an element.
fn extract_element_text(reply: &str, element: &str) -> Option<String> {
    let open = format!("<{}", element);
    let close = format!("</{}>", element);
    let start = reply.find(&open)?;
    let content_start = reply[start..].find('>')? + start + 1;
    let content_end = reply[content_start..].find(&close)?
        + content_start;
    Some(reply[content_start..content_end].to_string())
}

/// Finds a byte subsequence.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len())
        .position(|window| window == needle)
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn xml_escaping() {
        assert_eq!(
            escape_xml("a < b && c > d"),
            "a &lt; b &amp;&amp; c &gt; d"
        );
        assert_eq!(escape_xml("plain"), "plain");
    }

    #[test]
    fn rpc_errors_are_detected() {
        let reply = "\
            <rpc-reply>\
            <rpc-error>\
            <error-severity>error</error-severity>\
            <error-message>syntax error</error-message>\
            </rpc-error>\
            </rpc-reply>";
        assert_eq!(
            rpc_error_message(reply), Some("syntax error".into())
        );

        let ok = "<rpc-reply><ok/></rpc-reply>";
        assert_eq!(rpc_error_message(ok), None);
    }

    #[test]
    fn warnings_do_not_fail_rpcs() {
        let reply = "\
            <rpc-reply>\
            <rpc-error>\
            <error-severity>warning</error-severity>\
            <error-message>statement ignored</error-message>\
            </rpc-error>\
            <ok/>\
            </rpc-reply>";
        assert_eq!(rpc_error_message(reply), None);
    }

    #[test]
    fn element_text_extraction() {
        let reply = "\
            <rpc-reply>\
            <configuration-information>\n\
            [edit policy-options]\n\
            +  prefix-list AS64496 { ... }\n\
            </configuration-information>\
            </rpc-reply>";
        let diff = extract_element_text(
            reply, "configuration-information"
        ).unwrap();
        assert!(diff.contains("[edit policy-options]"));
        assert!(extract_element_text(reply, "absent").is_none());
    }

    #[test]
    fn frame_delimiter_search() {
        let data = b"<hello/>]]>]]>rest";
        let pos = find_subsequence(data, FRAME_END.as_bytes()).unwrap();
        assert_eq!(pos, 8);
        assert!(find_subsequence(b"nothing", b"]]>]]>").is_none());
    }
}
