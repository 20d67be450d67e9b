//! Command execution seam
//!
//! `Host` is the only way provisioning code reaches the outside world:
//! every external program runs through `Host::run`, every wait goes through
//! `Host::sleep`, and every generated file is written with `write_file`.
//!
//! `SystemHost` is the production implementation. Integration tests supply
//! their own `Host` that simulates Docker and the host tools.
//!
//! # Dry run
//!
//! With `dry_run` set, destructive commands are logged and reported as
//! successful without running; read-only commands still execute so probes
//! and status queries return real data. Generated files are not written.

use crate::commands::CommandArgs;
use crate::error::{DeployError, Result};
use crate::process_guard::{ChildTicket, CommandProcessGroup};
use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

/// Output from a command execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Exit code (None if terminated by signal or not run).
    pub exit_code: Option<i32>,
    /// Whether the command exited successfully.
    pub success: bool,
    /// True when the command was skipped by dry-run mode.
    pub dry_run: bool,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            exit_code: Some(0),
            success: true,
            ..Self::default()
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stderr: stderr.into(),
            exit_code: Some(code),
            success: false,
            ..Self::default()
        }
    }

    /// Placeholder returned for a destructive command skipped in dry-run mode
    pub fn skipped() -> Self {
        Self {
            success: true,
            dry_run: true,
            ..Self::default()
        }
    }

    /// Map a non-zero exit into `DeployError::Command`
    pub fn ensure_success(&self, command: &str) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            Err(DeployError::Command {
                command: command.to_string(),
                code: self.exit_code.unwrap_or(-1),
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Execution environment for provisioning and runtime-control operations.
pub trait Host {
    /// Run one external command. A non-zero exit is reported in the output,
    /// not as an error; an `Err` means the command could not be run at all.
    fn run(&self, cmd: &dyn CommandArgs) -> Result<CommandOutput>;

    /// Block the control thread.
    fn sleep(&self, duration: Duration);

    /// Whether mutations are being skipped.
    fn dry_run(&self) -> bool {
        false
    }

    /// Run and require a zero exit.
    fn run_checked(&self, cmd: &dyn CommandArgs) -> Result<CommandOutput> {
        let output = self.run(cmd)?;
        output.ensure_success(&cmd.display())?;
        Ok(output)
    }

    /// Run with standard output copied byte-for-byte into `sink` instead of
    /// being captured. Returns the output (with empty `stdout`) and the number
    /// of bytes copied.
    fn run_to_writer(
        &self,
        cmd: &dyn CommandArgs,
        sink: &mut dyn Write,
    ) -> Result<(CommandOutput, u64)> {
        let mut output = self.run(cmd)?;
        let bytes = std::mem::take(&mut output.stdout).into_bytes();
        sink.write_all(&bytes)?;
        Ok((output, bytes.len() as u64))
    }
}

/// Runs commands on the local machine.
#[derive(Debug, Clone, Default)]
pub struct SystemHost {
    dry_run: bool,
}

impl SystemHost {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }
}

impl Host for SystemHost {
    fn run(&self, cmd: &dyn CommandArgs) -> Result<CommandOutput> {
        let display = cmd.display();

        if self.dry_run && cmd.is_destructive() {
            log::info!("[dry-run] would run: {}", display);
            return Ok(CommandOutput::skipped());
        }

        if cmd.is_destructive() {
            log::info!("$ {}", display);
        } else {
            log::debug!("$ {}", display);
        }

        let input = cmd.stdin();
        let mut command = Command::new(cmd.program());
        command
            .args(cmd.to_cli_args())
            .envs(cmd.get_env_vars())
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group();

        let mut child = command.spawn().map_err(|e| DeployError::Command {
            command: display.clone(),
            code: 127,
            stderr: format!("failed to start {}: {}", cmd.program(), e),
        })?;
        let _ticket = ChildTicket::register(child.id());

        let writer = match (input, child.stdin.take()) {
            (Some(bytes), Some(mut pipe)) => Some(std::thread::spawn(move || {
                // the pipe closes when `pipe` drops, signalling EOF
                pipe.write_all(&bytes)
            })),
            _ => None,
        };

        let output = child.wait_with_output()?;

        if let Some(handle) = writer {
            match handle.join() {
                Ok(Err(e)) if e.kind() != std::io::ErrorKind::BrokenPipe => {
                    log::warn!("Writing stdin to `{}` failed: {}", display, e);
                }
                Err(_) => log::warn!("stdin writer for `{}` panicked", display),
                _ => {}
            }
        }

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
            success: output.status.success(),
            dry_run: false,
        };

        if !result.success {
            log::debug!(
                "`{}` exited with {:?}: {}",
                display,
                result.exit_code,
                result.stderr.trim()
            );
        }
        Ok(result)
    }

    fn run_to_writer(
        &self,
        cmd: &dyn CommandArgs,
        sink: &mut dyn Write,
    ) -> Result<(CommandOutput, u64)> {
        if cmd.stdin().is_some() || (self.dry_run && cmd.is_destructive()) {
            let mut output = self.run(cmd)?;
            let bytes = std::mem::take(&mut output.stdout).into_bytes();
            sink.write_all(&bytes)?;
            return Ok((output, bytes.len() as u64));
        }

        let display = cmd.display();
        log::debug!("$ {} (streamed)", display);

        let mut command = Command::new(cmd.program());
        command
            .args(cmd.to_cli_args())
            .envs(cmd.get_env_vars())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group();

        let mut child = command.spawn().map_err(|e| DeployError::Command {
            command: display.clone(),
            code: 127,
            stderr: format!("failed to start {}: {}", cmd.program(), e),
        })?;
        let _ticket = ChildTicket::register(child.id());

        let stderr_reader = child.stderr.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                buf
            })
        });

        let copied = match child.stdout.take() {
            Some(mut pipe) => std::io::copy(&mut pipe, sink),
            None => Ok(0),
        };
        if copied.is_err() {
            // a blocked writer never exits on its own
            let _ = child.kill();
        }
        let status = child.wait()?;
        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        let bytes = copied?;

        let result = CommandOutput {
            stdout: String::new(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: status.code(),
            success: status.success(),
            dry_run: false,
        };
        if !result.success {
            log::debug!(
                "`{}` exited with {:?}: {}",
                display,
                result.exit_code,
                result.stderr.trim()
            );
        }
        Ok((result, bytes))
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn dry_run(&self) -> bool {
        self.dry_run
    }
}

/// Write a generated file atomically with the given permission bits.
///
/// Parent directories are created. In dry-run mode the write is logged and skipped.
pub fn write_file(host: &dyn Host, path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    if host.dry_run() {
        log::info!("[dry-run] would write {} ({} bytes)", path.display(), contents.len());
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    {
        let mut file = fs::File::create(&tmp)?;
        file.set_permissions(fs::Permissions::from_mode(mode))?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    log::debug!("Wrote {} (mode {:o})", path.display(), mode);
    Ok(())
}

/// Create a directory tree unless running dry.
pub fn create_dir(host: &dyn Host, path: &Path) -> Result<()> {
    if host.dry_run() {
        log::info!("[dry-run] would create {}", path.display());
        return Ok(());
    }
    fs::create_dir_all(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::argv;

    struct Sh {
        script: &'static str,
        input: Option<Vec<u8>>,
        destructive: bool,
    }

    impl CommandArgs for Sh {
        fn program(&self) -> &'static str {
            "sh"
        }
        fn to_cli_args(&self) -> Vec<String> {
            argv(["-c", self.script])
        }
        fn stdin(&self) -> Option<Vec<u8>> {
            self.input.clone()
        }
        fn is_destructive(&self) -> bool {
            self.destructive
        }
    }

    #[test]
    fn test_captures_stdout_and_exit_code() {
        let host = SystemHost::new(false);
        let out = host
            .run(&Sh {
                script: "echo hello; echo oops >&2; exit 3",
                input: None,
                destructive: false,
            })
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success);
    }

    #[test]
    fn test_feeds_stdin() {
        let host = SystemHost::new(false);
        let out = host
            .run(&Sh {
                script: "cat",
                input: Some(b"piped".to_vec()),
                destructive: false,
            })
            .unwrap();
        assert_eq!(out.stdout, "piped");
    }

    #[test]
    fn test_dry_run_skips_destructive_only() {
        let host = SystemHost::new(true);
        let skipped = host
            .run(&Sh {
                script: "exit 1",
                input: None,
                destructive: true,
            })
            .unwrap();
        assert!(skipped.dry_run);
        assert!(skipped.success);

        let ran = host
            .run(&Sh {
                script: "echo real",
                input: None,
                destructive: false,
            })
            .unwrap();
        assert!(!ran.dry_run);
        assert_eq!(ran.stdout.trim(), "real");
    }

    #[test]
    fn test_run_checked_maps_failure() {
        let host = SystemHost::new(false);
        let err = host
            .run_checked(&Sh {
                script: "echo bad >&2; exit 2",
                input: None,
                destructive: false,
            })
            .unwrap_err();
        match err {
            DeployError::Command { code, stderr, .. } => {
                assert_eq!(code, 2);
                assert_eq!(stderr, "bad");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_streams_binary_stdout_unchanged() {
        let host = SystemHost::new(false);
        let mut sink = Vec::new();
        let (out, bytes) = host
            .run_to_writer(
                &Sh {
                    script: "printf '\\377\\376dump\\000'; echo note >&2",
                    input: None,
                    destructive: false,
                },
                &mut sink,
            )
            .unwrap();
        assert!(out.success);
        assert_eq!(sink, b"\xff\xfedump\x00");
        assert_eq!(bytes, 7);
        assert!(out.stdout.is_empty());
        assert_eq!(out.stderr.trim(), "note");
    }

    #[test]
    fn test_streamed_failure_keeps_exit_code() {
        let host = SystemHost::new(false);
        let mut sink = Vec::new();
        let (out, _) = host
            .run_to_writer(
                &Sh {
                    script: "echo partial; exit 4",
                    input: None,
                    destructive: false,
                },
                &mut sink,
            )
            .unwrap();
        assert_eq!(out.exit_code, Some(4));
        assert!(out.ensure_success("sh").is_err());
        assert_eq!(sink, b"partial\n");
    }

    #[test]
    fn test_write_file_sets_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/.env");
        write_file(&SystemHost::new(false), &path, b"A=1\n", 0o600).unwrap();
        let meta = fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        assert_eq!(fs::read_to_string(&path).unwrap(), "A=1\n");
    }

    #[test]
    fn test_write_file_dry_run_leaves_disk_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docker-compose.yml");
        write_file(&SystemHost::new(true), &path, b"services: {}\n", 0o644).unwrap();
        assert!(!path.exists());
    }
}
