//! Interactive operator input.
//!
//! Everything that needs an answer from the person at the terminal goes
//! through `Operator`, so flows can be driven by a script in tests and by
//! `--yes` flags in cron jobs.

use crate::error::{DeployError, Result};
use crossterm::style::Stylize;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, BufRead, Write};

pub trait Operator {
    /// Free-form answer. An empty answer yields `default` when one is given.
    fn prompt(&self, question: &str, default: Option<&str>) -> Result<String>;

    /// Yes/no question, defaulting to no
    fn confirm(&self, question: &str) -> Result<bool>;

    /// Pick one of `options`; returns its index
    fn choose(&self, title: &str, options: &[&str]) -> Result<usize>;
}

/// Reads answers from stdin
#[derive(Debug, Default)]
pub struct TerminalOperator;

impl TerminalOperator {
    fn read_line(&self) -> Result<String> {
        io::stdout().flush()?;
        let mut line = String::new();
        let read = io::stdin().lock().read_line(&mut line)?;
        if read == 0 {
            return Err(DeployError::aborted("input closed"));
        }
        Ok(line.trim().to_string())
    }
}

impl Operator for TerminalOperator {
    fn prompt(&self, question: &str, default: Option<&str>) -> Result<String> {
        match default {
            Some(d) => print!("{} [{}]: ", question.bold(), d),
            None => print!("{}: ", question.bold()),
        }
        let answer = self.read_line()?;
        Ok(match (answer.is_empty(), default) {
            (true, Some(d)) => d.to_string(),
            _ => answer,
        })
    }

    fn confirm(&self, question: &str) -> Result<bool> {
        print!("{} [y/N]: ", question.bold());
        Ok(is_yes(&self.read_line()?))
    }

    fn choose(&self, title: &str, options: &[&str]) -> Result<usize> {
        println!("\n{}", title.bold());
        for (i, option) in options.iter().enumerate() {
            println!("  {}) {}", i + 1, option);
        }
        loop {
            print!("Choice [1-{}]: ", options.len());
            if let Some(index) = parse_choice(&self.read_line()?, options.len()) {
                return Ok(index);
            }
            println!("Please enter a number between 1 and {}", options.len());
        }
    }
}

/// Answers from a fixed list, in order. Running out is an abort.
#[derive(Debug, Default)]
pub struct ScriptedOperator {
    answers: RefCell<VecDeque<String>>,
    asked: RefCell<Vec<String>>,
}

impl ScriptedOperator {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: RefCell::new(answers.into_iter().map(Into::into).collect()),
            asked: RefCell::new(Vec::new()),
        }
    }

    /// Every question asked so far
    pub fn asked(&self) -> Vec<String> {
        self.asked.borrow().clone()
    }

    fn next(&self, question: &str) -> Result<String> {
        self.asked.borrow_mut().push(question.to_string());
        self.answers
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| DeployError::aborted(format!("no answer for \"{}\"", question)))
    }
}

impl Operator for ScriptedOperator {
    fn prompt(&self, question: &str, default: Option<&str>) -> Result<String> {
        let answer = self.next(question)?;
        Ok(match (answer.is_empty(), default) {
            (true, Some(d)) => d.to_string(),
            _ => answer,
        })
    }

    fn confirm(&self, question: &str) -> Result<bool> {
        Ok(is_yes(&self.next(question)?))
    }

    fn choose(&self, title: &str, options: &[&str]) -> Result<usize> {
        let answer = self.next(title)?;
        parse_choice(&answer, options.len())
            .ok_or_else(|| DeployError::validation(format!("invalid choice: {}", answer)))
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

/// 1-based menu number to index
fn parse_choice(answer: &str, len: usize) -> Option<usize> {
    answer
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|n| (1..=len).contains(n))
        .map(|n| n - 1)
}

/// Ask for confirmation unless `assume_yes`; declining aborts
pub fn require_confirmation(operator: &dyn Operator, assume_yes: bool, question: &str) -> Result<()> {
    if assume_yes {
        log::info!("Confirmation assumed: {}", question);
        return Ok(());
    }
    if operator.confirm(question)? {
        Ok(())
    } else {
        Err(DeployError::aborted("declined by operator; nothing was changed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_answers_in_order() {
        let op = ScriptedOperator::new(["", "ops@example.com", "yes", "2"]);
        assert_eq!(op.prompt("Domain", Some("n8n.example.com")).unwrap(), "n8n.example.com");
        assert_eq!(op.prompt("Email", None).unwrap(), "ops@example.com");
        assert!(op.confirm("Continue?").unwrap());
        assert_eq!(op.choose("Menu", &["a", "b", "c"]).unwrap(), 1);
        assert!(op.confirm("Again?").is_err());
        assert_eq!(op.asked().len(), 5);
    }

    #[test]
    fn test_choice_bounds() {
        assert_eq!(parse_choice("1", 3), Some(0));
        assert_eq!(parse_choice("0", 3), None);
        assert_eq!(parse_choice("4", 3), None);
        assert_eq!(parse_choice("x", 3), None);
    }

    #[test]
    fn test_declined_confirmation_aborts() {
        let op = ScriptedOperator::new(["n"]);
        let err = require_confirmation(&op, false, "Restore?").unwrap_err();
        assert!(matches!(err, DeployError::Aborted(_)));
        assert!(err.is_side_effect_free());

        let silent = ScriptedOperator::default();
        require_confirmation(&silent, true, "Restore?").unwrap();
        assert!(silent.asked().is_empty());
    }
}
