use std::fmt;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_CREDENTIAL_HEADER: &str = "X-Auth-Token";

/// An authentication header attached to every request.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub header: String,
    pub value: String,
}

impl Credential {
    pub fn new(header: &str, value: &str) -> Self {
        Self {
            header: header.to_string(),
            value: value.to_string(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("header", &self.header)
            .field("value", &"<redacted>")
            .finish()
    }
}

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Identity command is empty")]
    EmptyCommand,
    #[error("Failed to spawn identity command {command:?}: {source}")]
    Spawn {
        command: Vec<String>,
        #[source]
        source: std::io::Error,
    },
    #[error("Identity command timed out after {0:?}")]
    Timeout(Duration),
    #[error("Identity command exited unsuccessfully ({0})")]
    CommandFailed(String),
    #[error("Identity command produced an empty token")]
    EmptyToken,
    #[error("Identity command I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Identity command standard output could not be read")]
    OutputUnavailable,
}

/// External collaborator that issues fresh credentials on demand.
pub trait IdentityProvider: Send {
    fn refresh(&mut self) -> Result<Credential, CredentialError>;
}

/// Obtains a token by running an external command and reading its standard output.
#[derive(Debug, Clone)]
pub struct CommandIdentityProvider {
    command: Vec<String>,
    header: String,
    timeout: Duration,
}

impl CommandIdentityProvider {
    pub fn new(command: Vec<String>, header: &str, timeout: Duration) -> Self {
        Self {
            command,
            header: header.to_string(),
            timeout,
        }
    }

    fn wait_with_timeout(&self, child: &mut Child) -> Result<std::process::ExitStatus, CredentialError> {
        let started = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if started.elapsed() > self.timeout {
                // The child may already be gone; the timeout is what gets reported.
                let _ = child.kill();
                let _ = child.wait();
                return Err(CredentialError::Timeout(self.timeout));
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

impl IdentityProvider for CommandIdentityProvider {
    fn refresh(&mut self) -> Result<Credential, CredentialError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or(CredentialError::EmptyCommand)?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| CredentialError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        // Drain stdout while waiting so a large token cannot fill the pipe and stall the child.
        let Some(mut stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CredentialError::OutputUnavailable);
        };
        let reader = std::thread::spawn(move || {
            let mut output = Vec::new();
            stdout.read_to_end(&mut output).map(|_| output)
        });

        // On timeout the reader is left detached; a surviving grandchild may hold the pipe.
        let status = self.wait_with_timeout(&mut child)?;
        let stdout = reader
            .join()
            .map_err(|_| CredentialError::OutputUnavailable)??;
        if !status.success() {
            return Err(CredentialError::CommandFailed(status.to_string()));
        }

        let token = String::from_utf8_lossy(&stdout).trim().to_string();
        if token.is_empty() {
            return Err(CredentialError::EmptyToken);
        }
        Ok(Credential {
            header: self.header.clone(),
            value: token,
        })
    }
}
