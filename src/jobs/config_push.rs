use crate::device::{ActionArgs, DeviceError, DeviceSession};
use crate::models::CONFIGURATION_OK;

const CANDIDATE_ACTIONS: &[&str] = &["load_merge_candidate", "load_replace_candidate"];

/// A configuration operation applied to every target
#[derive(Debug, Clone)]
pub struct ConfigPushAction {
    action: String,
    config: String,
}

impl ConfigPushAction {
    pub fn new(action: &str, config: &str) -> Self {
        Self {
            action: action.to_string(),
            config: config.to_string(),
        }
    }

    /// Candidate loads stage the script and commit it; anything else is
    /// invoked by name without arguments (rollback, discard_config, ...).
    pub fn execute(&self, session: &mut dyn DeviceSession) -> Result<String, DeviceError> {
        if CANDIDATE_ACTIONS.contains(&self.action.as_str()) {
            session.invoke(&self.action, ActionArgs::with_config(self.config.clone()))?;
            session.invoke("commit_config", ActionArgs::default())?;
        } else {
            session.invoke(&self.action, ActionArgs::default())?;
        }
        Ok(CONFIGURATION_OK.to_string())
    }

    pub fn diagnostic(err: &DeviceError) -> String {
        format!("configuration push did not work because of {}", err)
    }
}
