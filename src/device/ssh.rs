use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use super::drivers::{self, DriverProfile};
use super::{ActionArgs, ConnectionParams, DeviceConnector, DeviceError, DeviceSession};

/// Keyboard-interactive prompt handler that always responds with the password
struct PasswordPrompt {
    password: String,
}

impl ssh2::KeyboardInteractivePrompt for PasswordPrompt {
    fn prompt<'a>(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[ssh2::Prompt<'a>],
    ) -> Vec<String> {
        prompts.iter().map(|_| self.password.clone()).collect()
    }
}

/// Opens SSH sessions with ssh2 (libssh2)
#[derive(Debug, Clone)]
pub struct SshConnector {
    port: u16,
    timeout_secs: u64,
}

impl SshConnector {
    pub fn new(port: u16, timeout_secs: u64) -> Self {
        Self { port, timeout_secs }
    }
}

impl DeviceConnector for SshConnector {
    fn open(&self, params: &ConnectionParams) -> Result<Box<dyn DeviceSession>, DeviceError> {
        let profile = drivers::lookup(&params.driver)
            .ok_or_else(|| DeviceError::UnknownDriver(params.driver.clone()))?;

        let timeout = scaled_timeout(self.timeout_secs, params.delay_factor);
        let session = ssh_connect(&params.address, self.port, &params.username, &params.password, timeout)?;

        tracing::debug!("SSH session open to {} ({})", params.address, profile.name);
        Ok(Box::new(SshSession {
            session,
            profile,
            secret: params.secret.clone(),
            candidate: None,
        }))
    }
}

/// Scale the base timeout by the task's delay factor, saturating at u64::MAX
fn scaled_timeout(base_secs: u64, delay_factor: f64) -> u64 {
    let factor = if delay_factor.is_finite() { delay_factor.max(0.1) } else { 1.0 };
    // float to int `as` casts saturate
    ((base_secs as f64) * factor).ceil() as u64
}

/// libssh2 takes its blocking timeout in milliseconds as a u32
fn session_timeout_ms(timeout_secs: u64) -> u32 {
    u32::try_from(timeout_secs.saturating_mul(1000)).unwrap_or(u32::MAX)
}

/// Create an SSH session and authenticate with password + keyboard-interactive.
/// This is blocking, so call from a spawn_blocking context.
fn ssh_connect(
    host: &str,
    port: u16,
    user: &str,
    pass: &str,
    timeout_secs: u64,
) -> Result<ssh2::Session, DeviceError> {
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| DeviceError::Connection(format!("Invalid address {}:{}: {}", host, port, e)))?
        .next()
        .ok_or_else(|| DeviceError::Connection(format!("No address found for {}", host)))?;

    let tcp = TcpStream::connect_timeout(&addr, Duration::from_secs(timeout_secs))
        .map_err(|e| DeviceError::Connection(format!("TCP connection failed: {}", e)))?;

    tcp.set_read_timeout(Some(Duration::from_secs(timeout_secs))).ok();
    tcp.set_write_timeout(Some(Duration::from_secs(timeout_secs))).ok();

    let mut session = ssh2::Session::new()
        .map_err(|e| DeviceError::Connection(format!("Failed to create SSH session: {}", e)))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(session_timeout_ms(timeout_secs));
    session
        .handshake()
        .map_err(|e| DeviceError::Connection(format!("SSH handshake failed: {}", e)))?;

    // Try password auth first
    match session.userauth_password(user, pass) {
        Ok(_) if session.authenticated() => return Ok(session),
        _ => {}
    }

    // Try keyboard-interactive auth (needed for Arista EOS and similar)
    let mut prompter = PasswordPrompt {
        password: pass.to_string(),
    };
    let _ = session.userauth_keyboard_interactive(user, &mut prompter);

    if session.authenticated() {
        Ok(session)
    } else {
        Err(DeviceError::Authentication(format!(
            "all methods exhausted for user {}",
            user
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateMode {
    Merge,
    Replace,
}

struct SshSession {
    session: ssh2::Session,
    profile: &'static DriverProfile,
    secret: String,
    candidate: Option<(CandidateMode, String)>,
}

impl SshSession {
    /// Run one command on an exec channel
    fn exec(&self, command: &str) -> Result<String, DeviceError> {
        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| DeviceError::CommandExecution(format!("Failed to open channel: {}", e)))?;

        channel
            .exec(command)
            .map_err(|e| DeviceError::CommandExecution(format!("Failed to execute '{}': {}", command, e)))?;

        let mut output = String::new();
        channel
            .read_to_string(&mut output)
            .map_err(|e| DeviceError::CommandExecution(format!("Failed to read output: {}", e)))?;

        let _ = channel.wait_close();

        if let Some(line) = self.profile.find_error(&output) {
            return Err(DeviceError::CommandExecution(format!("'{}': {}", command, line)));
        }
        Ok(output)
    }

    /// Feed a multi-line payload to an interactive shell (network devices need a PTY)
    fn interactive(&self, payload: &str) -> Result<String, std::io::Error> {
        let mut channel = self.session.channel_session()?;
        channel.request_pty("vt100", None, Some((200, 50, 0, 0)))?;
        channel.shell()?;

        let mut script = String::new();
        if let Some(paging) = self.profile.disable_paging {
            script.push_str(paging);
            script.push('\n');
        }
        if let Some(enable) = self.profile.enable {
            if !self.secret.is_empty() {
                script.push_str(enable);
                script.push('\n');
                script.push_str(&self.secret);
                script.push('\n');
            }
        }
        script.push_str(payload);
        script.push_str("\nexit\n");

        channel.write_all(script.as_bytes())?;
        channel.send_eof()?;

        let mut output = String::new();
        channel.read_to_string(&mut output)?;
        let _ = channel.wait_close();
        Ok(output)
    }

    fn push_candidate(&mut self) -> Result<serde_json::Value, DeviceError> {
        let (mode, config) = self
            .candidate
            .take()
            .ok_or_else(|| DeviceError::ConfigurationCommit("no candidate configuration loaded".to_string()))?;

        let wrapper = match mode {
            CandidateMode::Merge => self.profile.merge_command,
            CandidateMode::Replace => self.profile.replace_command.ok_or_else(|| {
                DeviceError::UnsupportedAction(format!("load_replace_candidate on {}", self.profile.name))
            })?,
        };
        let payload = wrapper.replace("{CONFIG}", config.trim_end());

        let output = self
            .interactive(&payload)
            .map_err(|e| DeviceError::ConfigurationCommit(e.to_string()))?;
        if let Some(line) = self.profile.find_error(&output) {
            return Err(DeviceError::ConfigurationCommit(line.to_string()));
        }
        Ok(serde_json::Value::String(output))
    }

    fn run_getter(&self, getter: &str) -> Result<serde_json::Value, DeviceError> {
        let command = self
            .profile
            .getter_command(getter)
            .ok_or_else(|| DeviceError::UnsupportedAction(format!("{} on {}", getter, self.profile.name)))?;
        let output = self.exec(command)?;
        Ok(serde_json::json!({
            "command": command,
            "output": output.trim_end(),
        }))
    }
}

impl DeviceSession for SshSession {
    fn send_commands(&mut self, commands: &[String]) -> Result<String, DeviceError> {
        let mut outputs = Vec::with_capacity(commands.len());
        for command in commands {
            outputs.push(self.exec(command)?);
        }
        Ok(outputs.join("\n\n"))
    }

    fn send_config(&mut self, lines: &[String]) -> Result<(), DeviceError> {
        let payload = format!(
            "{}\n{}\n{}",
            self.profile.config_enter,
            lines.join("\n"),
            self.profile.config_exit
        );
        let output = self
            .interactive(&payload)
            .map_err(|e| DeviceError::CommandExecution(e.to_string()))?;
        match self.profile.find_error(&output) {
            Some(line) => Err(DeviceError::CommandExecution(line.to_string())),
            None => Ok(()),
        }
    }

    fn invoke(&mut self, action: &str, args: ActionArgs) -> Result<serde_json::Value, DeviceError> {
        match action {
            "load_merge_candidate" | "load_replace_candidate" => {
                let config = args
                    .config
                    .ok_or_else(|| DeviceError::ConfigurationCommit(format!("{} requires a configuration", action)))?;
                let mode = if action == "load_merge_candidate" {
                    CandidateMode::Merge
                } else {
                    CandidateMode::Replace
                };
                self.candidate = Some((mode, config));
                Ok(serde_json::Value::Null)
            }
            "commit_config" => self.push_candidate(),
            "discard_config" => {
                self.candidate = None;
                Ok(serde_json::Value::Null)
            }
            "rollback" => {
                let command = self
                    .profile
                    .rollback_command
                    .ok_or_else(|| DeviceError::UnsupportedAction(format!("rollback on {}", self.profile.name)))?;
                let output = self
                    .interactive(command)
                    .map_err(|e| DeviceError::ConfigurationCommit(e.to_string()))?;
                match self.profile.find_error(&output) {
                    Some(line) => Err(DeviceError::ConfigurationCommit(line.to_string())),
                    None => Ok(serde_json::Value::String(output)),
                }
            }
            getter if getter.starts_with("get_") => self.run_getter(getter),
            other => Err(DeviceError::UnsupportedAction(other.to_string())),
        }
    }

    fn close(&mut self) {
        if let Err(e) = self.session.disconnect(None, "session closed", None) {
            tracing::debug!("SSH disconnect failed: {}", e);
        }
    }
}
