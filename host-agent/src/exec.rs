// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running external commands

use std::process::Output;

#[derive(Debug)]
pub struct CommandFailureInfo {
    command: String,
    status: std::process::ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl std::fmt::Display for CommandFailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "command [{}] failed with status {}", self.command, self.status)?;
        if !self.stderr.is_empty() {
            write!(f, ": {}", self.stderr.trim_end())?;
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ExecutionError {
    #[error("failed to start [{command}]: {err}")]
    ExecutionStart { command: String, err: std::io::Error },

    #[error("{0}")]
    CommandFailure(Box<CommandFailureInfo>),

    #[error("failed to parse output of [{command}]: {message}")]
    ParseFailure { command: String, message: String },
}

pub(crate) fn command_to_string(command: &std::process::Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|s| s.to_string_lossy().into_owned())
        .collect::<Vec<String>>()
        .join(" ")
}

/// Runs `command` to completion, failing on a non-zero exit status.
pub async fn execute_async(
    command: &mut tokio::process::Command,
) -> Result<Output, ExecutionError> {
    let output = command.output().await.map_err(|err| {
        ExecutionError::ExecutionStart {
            command: command_to_string(command.as_std()),
            err,
        }
    })?;

    if !output.status.success() {
        return Err(ExecutionError::CommandFailure(Box::new(
            CommandFailureInfo {
                command: command_to_string(command.as_std()),
                status: output.status,
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            },
        )));
    }

    Ok(output)
}
