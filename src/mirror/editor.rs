//! External editor launcher
//!
//! Opens a mirrored file in the user's editor. The child process is kept so
//! the mirror can report whether the editor is still running.

use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::debug;

pub trait EditorLauncher: Send + Sync {
    /// Open `path`. `Ok(None)` means nothing was spawned.
    fn launch(&self, path: &Path) -> std::io::Result<Option<Child>>;
}

/// Runs a configured command line with the file path appended
#[derive(Debug, Clone)]
pub struct CommandEditorLauncher {
    program: String,
    args: Vec<String>,
}

impl CommandEditorLauncher {
    /// Split `command` on whitespace: program first, then fixed arguments.
    pub fn new(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl EditorLauncher for CommandEditorLauncher {
    fn launch(&self, path: &Path) -> std::io::Result<Option<Child>> {
        debug!("Launching {} {:?} {:?}", self.program, self.args, path);
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(Some(child))
    }
}

/// Launcher that never opens anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEditor;

impl EditorLauncher for NoEditor {
    fn launch(&self, _path: &Path) -> std::io::Result<Option<Child>> {
        Ok(None)
    }
}

/// Platform default opener
pub fn default_editor_command() -> &'static str {
    if cfg!(target_os = "macos") {
        "open"
    } else if cfg!(target_os = "windows") {
        "notepad"
    } else {
        "xdg-open"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_parsing() {
        let launcher = CommandEditorLauncher::new("code --wait").unwrap();
        assert_eq!(launcher.program, "code");
        assert_eq!(launcher.args, vec!["--wait"]);
        assert!(CommandEditorLauncher::new("   ").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_spawns_child() {
        let launcher = CommandEditorLauncher::new("true").unwrap();
        let mut child = launcher.launch(Path::new("/tmp/x")).unwrap().unwrap();
        assert!(child.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_missing_program_errors() {
        let launcher = CommandEditorLauncher::new("oxidesftp-no-such-editor").unwrap();
        assert!(launcher.launch(Path::new("/tmp/x")).is_err());
    }
}
