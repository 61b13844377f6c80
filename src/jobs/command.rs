use crate::device::{DeviceError, DeviceSession};
use crate::models::{CommandMode, Script, CONFIGURATION_OK};

/// Script lines sent to every target of a command-execution run
#[derive(Debug, Clone)]
pub struct CommandAction {
    mode: CommandMode,
    lines: Vec<String>,
}

impl CommandAction {
    pub fn new(mode: CommandMode, script: &Script) -> Self {
        let lines = script
            .content
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect();
        Self { mode, lines }
    }

    pub fn execute(&self, session: &mut dyn DeviceSession) -> Result<String, DeviceError> {
        match self.mode {
            CommandMode::Configuration => {
                session.send_config(&self.lines)?;
                Ok(CONFIGURATION_OK.to_string())
            }
            CommandMode::Show => {
                let mut outputs = Vec::with_capacity(self.lines.len());
                for line in &self.lines {
                    outputs.push(session.send_commands(std::slice::from_ref(line))?);
                }
                Ok(outputs.join("\n\n"))
            }
        }
    }

    pub fn diagnostic(err: &DeviceError) -> String {
        format!("command execution did not work because of {}", err)
    }
}
