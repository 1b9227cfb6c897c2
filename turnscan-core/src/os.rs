//! External program execution and argument templating.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Process-execution capability used by external-program peripherals.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OsGateway: Send + Sync {
    /// Runs `command` to completion. `true` when it exited successfully.
    async fn execute(&self, command: &str, arguments: &[String]) -> bool;

    /// Whether `path` names an executable file.
    fn is_executable(&self, path: &str) -> bool;

    /// Resolves a program name through `PATH`.
    fn find_program(&self, name: &str) -> Option<PathBuf>;
}

/// [`OsGateway`] spawning real processes through tokio.
#[derive(Clone, Copy, Default)]
pub struct ProcessGateway;

impl fmt::Debug for ProcessGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProcessGateway")
    }
}

#[async_trait]
impl OsGateway for ProcessGateway {
    async fn execute(&self, command: &str, arguments: &[String]) -> bool {
        info!(command, ?arguments, "executing external program");

        let output = Command::new(command)
            .args(arguments)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                debug!(
                    command,
                    stdout = %String::from_utf8_lossy(&output.stdout),
                    "external program finished"
                );
                true
            }
            Ok(output) => {
                warn!(
                    command,
                    status = %output.status,
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "external program failed"
                );
                false
            }
            Err(err) => {
                warn!(command, error = %err, "could not start external program");
                false
            }
        }
    }

    fn is_executable(&self, path: &str) -> bool {
        if path.trim().is_empty() {
            return false;
        }
        is_executable_file(Path::new(path))
    }

    fn find_program(&self, name: &str) -> Option<PathBuf> {
        which::which(name).ok()
    }
}

#[cfg(unix)]
fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable_file(path: &Path) -> bool {
    path.is_file()
}

/// Builds an argument list from a configured template.
///
/// The template is split on whitespace first and placeholders are replaced
/// inside each token afterwards, so substituted paths containing spaces stay
/// a single argument.
pub fn expand_arguments(template: &str, substitutions: &[(&str, &str)]) -> Vec<String> {
    template
        .split_whitespace()
        .map(|token| substitute(token, substitutions))
        .collect()
}

/// Replaces every `{placeholder}` of `substitutions` in `value`.
pub fn substitute(value: &str, substitutions: &[(&str, &str)]) -> String {
    substitutions
        .iter()
        .fold(value.to_string(), |acc, (placeholder, replacement)| {
            acc.replace(placeholder, replacement)
        })
}

/// Placeholder for the file a camera or remover writes.
pub const TARGET_FILE: &str = "{targetFile}";
/// Placeholder for the file a remover reads.
pub const SOURCE_FILE: &str = "{sourceFile}";
/// Placeholder for the project root.
pub const PROJECT_DIR: &str = "{projectDir}";
/// Placeholder for the model creator's input directory.
pub const INPUT_DIR: &str = "{inputDir}";
/// Placeholder for the directory of the model being edited.
pub const MODEL_DIR: &str = "{modelDir}";
