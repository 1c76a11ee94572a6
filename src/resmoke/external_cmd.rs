use std::{
    path::Path,
    process::{Command, Stdio},
};

use anyhow::{bail, Result};
use tracing::{event, Level};

/// Run an external command and return the output.
///
/// # Arguments
///
/// * `command` - Command with arguments to run.
///
/// # Return
///
/// The output of the command.
pub fn run_command(command: &[&str]) -> Result<String> {
    run_command_in_dir(command, None)
}

/// Run an external command from the given working directory and return the output.
pub fn run_command_in_dir(command: &[&str], working_dir: Option<&Path>) -> Result<String> {
    let binary = command[0];
    let args = &command[1..];
    let mut cmd = Command::new(binary);
    cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    let output = cmd.spawn()?.wait_with_output()?;

    if !output.status.success() {
        let error_message = String::from_utf8_lossy(&output.stderr).to_string();
        let regular_info = String::from_utf8_lossy(&output.stdout).to_string();

        event!(
            Level::ERROR,
            binary = binary,
            args = args.join(" "),
            error_message = error_message,
            stdout = regular_info,
            "Command encountered an error",
        );
        bail!(error_message)
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
