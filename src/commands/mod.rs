//! Type-safe external command contracts.
//!
//! Every program the provisioner invokes is described by a struct that
//! implements `CommandArgs`. The struct definition is the contract: flag
//! spelling lives in exactly one place and the compiler catches mismatches.
//! Execution goes through `Host::run` (see `crate::host`), never through a
//! raw `std::process::Command` in orchestration code.
//!
//! # Modules
//!
//! - `compose`: `docker compose` against the installation's manifest
//! - `system`: apt, dpkg, systemctl, ufw, chown, curl, crontab, docker housekeeping
//! - `tls`: certbot, nginx, openssl

pub mod compose;
pub mod system;
pub mod tls;

/// Trait for typed command arguments.
///
/// # Contract
///
/// - `program()`: executable name resolved through `PATH`.
/// - `to_cli_args()`: arguments exactly as the program expects them.
/// - `get_env_vars()`: extra environment for the child.
/// - `stdin()`: bytes fed to the child's standard input, if any.
/// - `is_destructive()`: true when the command mutates host or deployment state.
///   Dry-run mode skips destructive commands and still runs read-only ones.
/// - `is_sensitive()`: true when arguments must not be logged verbatim.
pub trait CommandArgs {
    /// Executable name (e.g., `docker`).
    fn program(&self) -> &'static str;

    /// Convert struct fields to CLI arguments.
    fn to_cli_args(&self) -> Vec<String>;

    /// Environment variables required by the command.
    fn get_env_vars(&self) -> Vec<(String, String)> {
        vec![]
    }

    /// Standard input for the command.
    fn stdin(&self) -> Option<Vec<u8>> {
        None
    }

    /// Whether the command changes state.
    fn is_destructive(&self) -> bool;

    /// Whether the arguments carry data that must not reach the log.
    fn is_sensitive(&self) -> bool {
        false
    }

    /// Human-readable rendering for logs and error messages.
    fn display(&self) -> String {
        if self.is_sensitive() {
            return format!("{} <redacted>", self.program());
        }
        let mut parts = vec![self.program().to_string()];
        parts.extend(self.to_cli_args().into_iter().map(|a| quote_for_display(&a)));
        parts.join(" ")
    }
}

/// Quote an argument for display the way a shell user would type it.
fn quote_for_display(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,%@+{}".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Helper to turn `&str` slices into owned argument vectors.
pub(crate) fn argv<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
