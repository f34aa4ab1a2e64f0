//! Terminal I/O utilities for CLI.
//!
//! Provides TTY detection, user prompting and the interactive phase gate.

use std::io::{self, BufRead, IsTerminal, Write};

use keel::pipeline::{GateDecision, Phase, PhaseGate};

pub fn is_stdin_tty() -> bool {
    io::stdin().is_terminal()
}

pub fn is_stdout_tty() -> bool {
    io::stdout().is_terminal()
}

pub fn require_tty_for_interactive() -> bool {
    is_stdin_tty() && is_stdout_tty()
}

pub fn prompt(message: &str) -> keel::Result<String> {
    eprint!("{}", message);
    io::stderr().flush().ok();

    let stdin = io::stdin();
    let mut line = String::new();
    let read = stdin
        .lock()
        .read_line(&mut line)
        .map_err(|e| keel::Error::internal_io(e.to_string(), Some("read stdin".to_string())))?;
    if read == 0 {
        return Err(keel::Error::internal_io(
            "end of input".to_string(),
            Some("read stdin".to_string()),
        ));
    }

    Ok(line.trim().to_string())
}

/// Print status message to stderr if running in a terminal.
pub fn status(message: &str) {
    if io::stderr().is_terminal() {
        eprintln!("{}", message);
    }
}

/// Asks on stderr before each phase: run, skip or abort.
pub struct PromptGate;

impl PhaseGate for PromptGate {
    fn decide(&self, phase: &Phase) -> GateDecision {
        for step in &phase.steps {
            eprintln!("  - {}", step);
        }
        let question = if phase.skippable {
            format!("Run phase '{}' ({})? [Y/n/s/q] ", phase.id, phase.description)
        } else {
            format!("Run phase '{}' ({})? [Y/n/q] ", phase.id, phase.description)
        };

        loop {
            let answer = match prompt(&question) {
                Ok(answer) => answer.to_lowercase(),
                // Closed stdin cannot confirm anything.
                Err(_) => return GateDecision::Abort,
            };
            match parse_answer(&answer, phase.skippable) {
                Some(decision) => return decision,
                None => eprintln!("Answer y (run), s (skip) or q (abort)."),
            }
        }
    }
}

fn parse_answer(answer: &str, skippable: bool) -> Option<GateDecision> {
    match answer {
        "" | "y" | "yes" => Some(GateDecision::Run),
        "s" | "skip" if skippable => Some(GateDecision::Skip),
        "n" | "no" | "q" | "quit" => Some(GateDecision::Abort),
        _ => None,
    }
}

// log_status! macro is defined in lib.rs (#[macro_export]) and available crate-wide.

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_answer_runs_the_phase() {
        assert_eq!(parse_answer("", true), Some(GateDecision::Run));
    }

    #[test]
    fn required_phase_cannot_be_skipped() {
        assert_eq!(parse_answer("s", false), None);
        assert_eq!(parse_answer("s", true), Some(GateDecision::Skip));
        assert_eq!(parse_answer("q", false), Some(GateDecision::Abort));
    }
}
