pub mod drivers;
mod ssh;

pub use ssh::SshConnector;

use std::fmt;
use std::ops::{Deref, DerefMut};

/// Failure talking to a single device
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("command failed: {0}")]
    CommandExecution(String),
    #[error("configuration commit failed: {0}")]
    ConfigurationCommit(String),
    #[error("unsupported action: {0}")]
    UnsupportedAction(String),
    #[error("unknown driver: {0}")]
    UnknownDriver(String),
}

/// Everything needed to open a session to one device
#[derive(Clone)]
pub struct ConnectionParams {
    pub address: String,
    pub driver: String,
    pub username: String,
    pub password: String,
    pub secret: String,
    /// Multiplier applied to the connector's I/O timeout
    pub delay_factor: f64,
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("address", &self.address)
            .field("driver", &self.driver)
            .field("username", &self.username)
            .field("delay_factor", &self.delay_factor)
            .finish_non_exhaustive()
    }
}

/// Keyword arguments for [`DeviceSession::invoke`]
#[derive(Debug, Clone, Default)]
pub struct ActionArgs {
    pub config: Option<String>,
}

impl ActionArgs {
    pub fn with_config(config: impl Into<String>) -> Self {
        Self {
            config: Some(config.into()),
        }
    }
}

/// An open, stateful connection to one device.
///
/// All methods block, so sessions are driven from the blocking pool.
pub trait DeviceSession: Send {
    /// Run show-style commands, returning their outputs separated by blank lines
    fn send_commands(&mut self, commands: &[String]) -> Result<String, DeviceError>;

    /// Apply configuration lines in configuration mode
    fn send_config(&mut self, lines: &[String]) -> Result<(), DeviceError>;

    /// Invoke a named operation (candidate staging, commit, rollback, getters)
    fn invoke(&mut self, action: &str, args: ActionArgs) -> Result<serde_json::Value, DeviceError>;

    fn close(&mut self);
}

/// Opens device sessions
pub trait DeviceConnector: Send + Sync {
    fn open(&self, params: &ConnectionParams) -> Result<Box<dyn DeviceSession>, DeviceError>;
}

/// Closes the wrapped session when dropped
pub struct SessionGuard {
    session: Box<dyn DeviceSession>,
}

impl SessionGuard {
    pub fn new(session: Box<dyn DeviceSession>) -> Self {
        Self { session }
    }
}

impl Deref for SessionGuard {
    type Target = dyn DeviceSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session.as_mut()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.session.close();
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn params(address: &str) -> ConnectionParams {
        ConnectionParams {
            address: address.to_string(),
            driver: "ios".to_string(),
            username: "admin".to_string(),
            password: "admin".to_string(),
            secret: String::new(),
            delay_factor: 1.0,
        }
    }

    #[test]
    fn test_guard_closes_session_on_drop() {
        let connector = FakeConnector::default();
        connector.add("10.0.0.1", FakeDevice::default().with_output("show clock", "10:00"));

        {
            let mut session = SessionGuard::new(connector.open(&params("10.0.0.1")).unwrap());
            assert!(session.send_commands(&["show bogus".to_string()]).is_err());
        }

        assert_eq!(connector.journal.lock().unwrap().closed, vec!["10.0.0.1"]);
    }

    #[test]
    fn test_params_debug_hides_password() {
        let mut p = params("10.0.0.1");
        p.password = "s3cret-pass".to_string();
        p.secret = "s3cret-enable".to_string();
        let debug = format!("{:?}", p);
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("10.0.0.1"));
    }

    #[test]
    fn test_error_messages_embed_cause() {
        let err = DeviceError::Connection("TCP connection failed: refused".to_string());
        assert_eq!(err.to_string(), "connection failed: TCP connection failed: refused");
    }
}
