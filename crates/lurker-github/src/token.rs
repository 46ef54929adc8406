use std::ffi::OsString;
use std::io;
use std::process::Command;

use crate::{HostingError, HostingResult};

/// Environment variable holding the hosting credential.
pub const TOKEN_ENV: &str = "GITHUB_TOKEN";

const HELPER_BINARY: &str = "gh";

pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[OsString]) -> io::Result<std::process::Output>;
}

#[derive(Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> io::Result<std::process::Output> {
        Command::new(program).args(args).output()
    }
}

/// Resolves the hosting credential: `GITHUB_TOKEN`, falling back to the
/// `gh auth token` helper. An empty token is fatal.
pub fn resolve_token(runner: &dyn CommandRunner) -> HostingResult<String> {
    let token = match std::env::var(TOKEN_ENV) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_owned(),
        _ => helper_token(runner)?,
    };

    if token.is_empty() {
        return Err(HostingError::Credentials("empty token".to_owned()));
    }
    Ok(token)
}

fn helper_token(runner: &dyn CommandRunner) -> HostingResult<String> {
    let args = vec![OsString::from("auth"), OsString::from("token")];
    let output = runner.run(HELPER_BINARY, &args).map_err(|error| {
        HostingError::Credentials(format!(
            "no {TOKEN_ENV} and `gh auth token` failed: {error}"
        ))
    })?;

    if !output.status.success() {
        return Err(HostingError::Credentials(format!(
            "no {TOKEN_ENV} and `gh auth token` exited with {}",
            output.status
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}
