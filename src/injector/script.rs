//! External shell script execution.
//!
//! The script runs once per call. Its stdout/stderr is scanned for two
//! sentinel prefixes:
//!
//! - `X-CHAOS-ERROR: <message>` fails the call with an injected fault
//! - `X-CHAOS-HEADER: <key>=<value>` sets a metadata entry on the frame

use super::{Injector, InjectorType, Registry};
use crate::config::{ActionConfig, ScriptAction};
use crate::error::ChaosError;
use crate::frame::Frame;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::Write;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempPath;
use tokio::process::Command;
use tracing::debug;

const SUPPORTED_LANGUAGES: [&str; 2] = ["sh", "bash"];
const ERROR_MARKER: &str = "X-CHAOS-ERROR:";
const HEADER_MARKER: &str = "X-CHAOS-HEADER:";
const ERROR_METADATA_KEY: &str = "x-chaos-error";

/// Runs a `sh`/`bash` script against each matched call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptInjector {
    language: String,
    source: String,
    entrypoint: String,
    timeout: Option<Duration>,
    env: BTreeMap<String, String>,
    args: Vec<String>,
}

impl ScriptInjector {
    /// The language is checked per call, not here.
    pub fn new(action: &ScriptAction) -> Result<Self, ChaosError> {
        if !action.entrypoint.is_empty() && !is_shell_identifier(&action.entrypoint) {
            return Err(ChaosError::invalid(format!(
                "script entrypoint {:?} is not a shell function name",
                action.entrypoint
            )));
        }
        Ok(Self {
            language: action.language.clone(),
            source: action.source.clone(),
            entrypoint: action.entrypoint.clone(),
            timeout: (action.timeout_ms > 0).then(|| Duration::from_millis(action.timeout_ms)),
            env: action.env.clone(),
            args: action.args.clone(),
        })
    }

    fn from_config(config: &ActionConfig) -> Result<Self, ChaosError> {
        match config {
            ActionConfig::Script(action) => Self::new(action),
            other => Err(ChaosError::invalid(format!(
                "script injector given {} config",
                other.kind()
            ))),
        }
    }

    fn script_body(&self) -> String {
        if self.entrypoint.is_empty() {
            self.source.clone()
        } else {
            format!("{}\n{} \"$@\"\n", self.source, self.entrypoint)
        }
    }
}

fn is_shell_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Write the script to a private temp file; the file is deleted when the
/// returned path is dropped.
fn write_temp_script(body: &str) -> Result<TempPath, ChaosError> {
    let mut file = tempfile::Builder::new()
        .prefix("grpc-chaos-script-")
        .suffix(".sh")
        .tempfile()?;
    file.write_all(body.as_bytes())?;
    file.flush()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o700))?;
    }

    Ok(file.into_temp_path())
}

/// Apply sentinel lines to the frame; returns the injected error message, if any.
fn apply_script_output(output: &str, frame: &mut Frame) -> Option<String> {
    let mut injected = None;
    for line in output.lines() {
        if let Some(msg) = line.strip_prefix(ERROR_MARKER) {
            let msg = msg.trim().to_string();
            frame.metadata.set(ERROR_METADATA_KEY, msg.clone());
            injected = Some(msg);
        } else if let Some(kv) = line.strip_prefix(HEADER_MARKER) {
            if let Some((key, value)) = kv.trim().split_once('=') {
                frame.metadata.set(key.trim(), value.trim());
            }
        }
    }
    injected
}

#[async_trait]
impl Injector for ScriptInjector {
    async fn apply(&self, frame: &mut Frame) -> Result<(), ChaosError> {
        if !SUPPORTED_LANGUAGES.contains(&self.language.as_str()) {
            return Err(ChaosError::UnsupportedLanguage(self.language.clone()));
        }

        let ctx = match self.timeout {
            Some(timeout) => frame.context.with_timeout(timeout),
            None => frame.context.clone(),
        };

        let script = write_temp_script(&self.script_body())?;

        let child = Command::new(&self.language)
            .arg(&*script)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        debug!(language = %self.language, method = %frame.method, "Running chaos script");

        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            reason = ctx.done() => {
                return Err(match reason {
                    ChaosError::DeadlineExceeded => ChaosError::ScriptTimeout,
                    other => other,
                });
            }
        };
        drop(script);

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(ChaosError::ScriptFailed {
                status: output.status.to_string(),
                output: combined,
            });
        }

        match apply_script_output(&combined, frame) {
            Some(msg) => Err(ChaosError::ScriptInjected(msg)),
            None => Ok(()),
        }
    }
}

pub(super) fn register(registry: &Registry) {
    registry.register(InjectorType::Script, |config, _| {
        Ok(Arc::new(ScriptInjector::from_config(config)?))
    });
}
