//! The external syntax checker run over the whole ledger after every write.

use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const DEFAULT_PROGRAM: &str = "bean-check";
const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub enabled: bool,
    pub program: String,
    /// Passed before the ledger path.
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: DEFAULT_PROGRAM.to_string(),
            args: Vec::new(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValidatorError {
    /// The checker ran and reported problems.
    #[error("ledger rejected: {output}")]
    Rejected { output: String },
    #[error("{program} did not finish within {timeout_secs}s")]
    TimedOut { program: String, timeout_secs: u64 },
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Checks a ledger after it has been written.
pub trait LedgerValidator {
    fn validate(&self, root: &Path) -> Result<(), ValidatorError>;
}

impl<F> LedgerValidator for F
where
    F: Fn(&Path) -> Result<(), ValidatorError>,
{
    fn validate(&self, root: &Path) -> Result<(), ValidatorError> {
        self(root)
    }
}

/// Accepts everything; used when validation is switched off.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoValidation;

impl LedgerValidator for NoValidation {
    fn validate(&self, root: &Path) -> Result<(), ValidatorError> {
        log::debug!("validation disabled, skipping {}", root.display());
        Ok(())
    }
}

/// Runs `<program> [args..] <root>`. Zero exit with no output is a pass;
/// anything else is a rejection carrying the output.
#[derive(Debug, Clone)]
pub struct CommandValidator {
    config: ValidatorConfig,
}

impl CommandValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    fn program_path(&self) -> OsString {
        match which::which(&self.config.program) {
            Ok(path) => path.into_os_string(),
            Err(_) => OsString::from(&self.config.program),
        }
    }
}

impl LedgerValidator for CommandValidator {
    fn validate(&self, root: &Path) -> Result<(), ValidatorError> {
        let program = &self.config.program;
        log::info!("running {program} on {}", root.display());
        let mut child = Command::new(self.program_path())
            .args(&self.config.args)
            .arg(root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ValidatorError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let status = wait_with_timeout(&mut child, timeout).map_err(|source| {
            ValidatorError::Spawn {
                program: program.clone(),
                source,
            }
        })?;

        let Some(status) = status else {
            let _ = child.kill();
            let _ = child.wait();
            log::warn!("{program} timed out after {}s", self.config.timeout_secs);
            return Err(ValidatorError::TimedOut {
                program: program.clone(),
                timeout_secs: self.config.timeout_secs,
            });
        };

        let mut output = join_output(stdout);
        output.push_str(&join_output(stderr));
        let output = output.trim().to_string();
        if status.success() && output.is_empty() {
            return Ok(());
        }
        Err(ValidatorError::Rejected {
            output: if output.is_empty() {
                format!("{program} exited with {status}")
            } else {
                output
            },
        })
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn join_output(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
) -> io::Result<Option<std::process::ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// The validator a config asks for.
pub fn from_config(config: &ValidatorConfig) -> Box<dyn LedgerValidator> {
    if config.enabled {
        Box::new(CommandValidator::new(config.clone()))
    } else {
        Box::new(NoValidation)
    }
}
