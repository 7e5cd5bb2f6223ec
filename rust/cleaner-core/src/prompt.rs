// rust/cleaner-core/src/prompt.rs

//! Interactive confirmation before destructive actions.

use std::io::{self, BufRead, Write};

/// Asks the operator to confirm an action.
pub trait Confirmation: Send + Sync {
    /// Returns true if the action described by `message` may proceed.
    fn confirm(&self, message: &str) -> bool;
}

impl<F> Confirmation for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn confirm(&self, message: &str) -> bool {
        self(message)
    }
}

/// Prompts on stdout and reads a `y`/`n` answer from stdin.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdinPrompt;

impl Confirmation for StdinPrompt {
    fn confirm(&self, message: &str) -> bool {
        let stdin = io::stdin();
        let mut input = stdin.lock();
        let mut output = io::stdout();
        ask(message, &mut input, &mut output)
    }
}

/// Declines every request. Used when nobody is there to answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deny;

impl Confirmation for Deny {
    fn confirm(&self, message: &str) -> bool {
        tracing::debug!(message, "declining confirmation in non-interactive mode");
        false
    }
}

/// Writes the prompt and reads one answer. Only `y` (any case) confirms;
/// an unreadable stream counts as a refusal.
fn ask(message: &str, input: &mut impl BufRead, output: &mut impl Write) -> bool {
    if write!(output, "{message} (y/n) ").and_then(|_| output.flush()).is_err() {
        return false;
    }

    let mut answer = String::new();
    match input.read_line(&mut answer) {
        Ok(_) => answer.trim().eq_ignore_ascii_case("y"),
        Err(e) => {
            tracing::warn!(error = %e, "failed to read confirmation");
            false
        }
    }
}
