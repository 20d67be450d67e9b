//! Operator-facing status lines on stdout.
//!
//! Diagnostics go through `log` to stderr; this module only prints what the
//! operator is meant to read while the installer runs.

use crate::probe::{CheckResult, CheckStatus};
use crossterm::style::{Color, Stylize};

/// Color palette for status output
pub struct Colors;

impl Colors {
    pub const SUCCESS: Color = Color::Green;
    pub const WARNING: Color = Color::Yellow;
    pub const ERROR: Color = Color::Red;
    pub const HEADING: Color = Color::Cyan;
    pub const MUTED: Color = Color::DarkGrey;
}

/// Status symbols
pub struct Symbols;

impl Symbols {
    pub const OK: &'static str = "✓";
    pub const WARN: &'static str = "⚠";
    pub const FAIL: &'static str = "✗";
    pub const ARROW: &'static str = "→";
}

/// `[step/total] title`
pub fn stage(index: u8, total: u8, title: &str) {
    println!(
        "\n{} {}",
        format!("[{}/{}]", index, total).with(Colors::MUTED),
        title.with(Colors::HEADING).bold()
    );
}

pub fn heading(text: &str) {
    println!("\n{}", text.with(Colors::HEADING).bold());
}

pub fn success(text: &str) {
    println!("  {} {}", Symbols::OK.with(Colors::SUCCESS), text);
}

pub fn warn(text: &str) {
    println!("  {} {}", Symbols::WARN.with(Colors::WARNING), text);
}

pub fn fail(text: &str) {
    println!("  {} {}", Symbols::FAIL.with(Colors::ERROR), text);
}

pub fn hint(text: &str) {
    println!("    {} {}", Symbols::ARROW.with(Colors::MUTED), text);
}

pub fn info(text: &str) {
    println!("  {}", text);
}

/// One probe check, with remediation for anything not passing
pub fn check(result: &CheckResult) {
    let line = result.to_string();
    match result.status {
        CheckStatus::Pass => success(&line),
        CheckStatus::Warn => warn(&line),
        CheckStatus::Fatal => fail(&line),
    }
    if result.status != CheckStatus::Pass {
        if let Some(remediation) = &result.remediation {
            hint(remediation);
        }
    }
}

/// `key: value` line with an aligned key column
pub fn field(key: &str, value: &str) {
    println!("  {:<18} {}", format!("{}:", key).with(Colors::MUTED), value);
}
