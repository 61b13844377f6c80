use crate::device::{ActionArgs, DeviceError, DeviceSession};

/// Read-only getters collected from every target
#[derive(Debug, Clone)]
pub struct GettersAction {
    getters: Vec<String>,
}

impl GettersAction {
    pub fn new(getters: &[String]) -> Self {
        Self {
            getters: getters.to_vec(),
        }
    }

    /// Collect every getter into one JSON object keyed by getter name.
    /// A failing getter is recorded in place and does not stop the others.
    pub fn execute(&self, session: &mut dyn DeviceSession) -> Result<String, DeviceError> {
        let mut results = serde_json::Map::new();
        for getter in &self.getters {
            let value = match session.invoke(getter, ActionArgs::default()) {
                Ok(value) => value,
                Err(e) => serde_json::Value::String(format!("{} could not be retrieved because of {}", getter, e)),
            };
            results.insert(getter.clone(), value);
        }
        serde_json::to_string_pretty(&results)
            .map_err(|e| DeviceError::CommandExecution(format!("could not serialize getters: {}", e)))
    }

    pub fn diagnostic(err: &DeviceError) -> String {
        format!("could not be retrieved because of {}", err)
    }
}
