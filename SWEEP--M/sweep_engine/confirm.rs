use std::io::{self, BufRead, Write};

use anyhow::Result;

/// Answers yes/no questions guarding costly or optional steps.
pub trait ConfirmationPolicy: Send + Sync {
    /// Returns the answer to `prompt`; `default` is the answer to use when
    /// the operator gives none.
    fn confirm(&self, prompt: &str, default: bool) -> Result<bool>;
}

/// Answers yes to everything (`--yes`).
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeYes;

impl ConfirmationPolicy for AssumeYes {
    fn confirm(&self, _prompt: &str, _default: bool) -> Result<bool> {
        Ok(true)
    }
}

/// Answers no to everything (`--no`).
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeNo;

impl ConfirmationPolicy for AssumeNo {
    fn confirm(&self, _prompt: &str, _default: bool) -> Result<bool> {
        Ok(false)
    }
}

/// Uses each question's default without asking (non-interactive sessions).
#[derive(Debug, Clone, Copy, Default)]
pub struct UseDefaults;

impl ConfirmationPolicy for UseDefaults {
    fn confirm(&self, _prompt: &str, default: bool) -> Result<bool> {
        Ok(default)
    }
}

/// Asks on stdout and reads the answer from stdin.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdinPrompt;

impl ConfirmationPolicy for StdinPrompt {
    fn confirm(&self, prompt: &str, default: bool) -> Result<bool> {
        let hint = if default { "[Y/n]" } else { "[y/N]" };
        let stdin = io::stdin();
        let mut stdout = io::stdout();
        loop {
            write!(stdout, "{prompt} {hint} ")?;
            stdout.flush()?;
            let mut line = String::new();
            if stdin.lock().read_line(&mut line)? == 0 {
                return Ok(default);
            }
            if let Some(answer) = parse_answer(&line, default) {
                return Ok(answer);
            }
        }
    }
}

/// Interprets a typed answer; empty means `default`, unknown text asks again.
#[must_use]
pub fn parse_answer(raw: &str, default: bool) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => Some(default),
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_policies_ignore_defaults() {
        assert!(AssumeYes.confirm("run?", false).unwrap());
        assert!(!AssumeNo.confirm("run?", true).unwrap());
        assert!(UseDefaults.confirm("colors?", true).unwrap());
    }

    #[test]
    fn parses_typed_answers() {
        assert_eq!(parse_answer("Yes\n", false), Some(true));
        assert_eq!(parse_answer(" n ", true), Some(false));
        assert_eq!(parse_answer("\n", true), Some(true));
        assert_eq!(parse_answer("maybe", true), None);
    }
}
