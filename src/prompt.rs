//! Operator prompts.
//!
//! Steps never read stdin directly; they ask a [`Prompter`]. Interactive
//! runs use [`InquirePrompter`], `--yes` runs use [`AssumeYes`], which takes
//! the default answer everywhere and refuses questions that have none.

use crate::error::{LabError, Result};
use inquire::{Confirm, InquireError, Select, Text};

/// Source of answers for the few questions a phase needs to ask.
pub trait Prompter {
    /// Yes/no question.
    fn confirm(&self, message: &str, default: bool) -> Result<bool>;

    /// Free-form text. An empty answer yields `default` when one is given.
    fn text(&self, message: &str, default: Option<&str>) -> Result<String>;

    /// Pick one of `options`, returning its index.
    fn select(&self, message: &str, options: &[String]) -> Result<usize>;
}

/// Terminal prompts backed by `inquire`.
#[derive(Debug, Default, Clone, Copy)]
pub struct InquirePrompter;

fn map_inquire_err(err: InquireError) -> LabError {
    match err {
        InquireError::OperationCanceled | InquireError::OperationInterrupted => {
            LabError::Interrupted
        }
        other => LabError::prompt(other.to_string()),
    }
}

impl Prompter for InquirePrompter {
    fn confirm(&self, message: &str, default: bool) -> Result<bool> {
        Confirm::new(message)
            .with_default(default)
            .prompt()
            .map_err(map_inquire_err)
    }

    fn text(&self, message: &str, default: Option<&str>) -> Result<String> {
        let mut prompt = Text::new(message);
        if let Some(d) = default {
            prompt = prompt.with_default(d);
        }
        prompt.prompt().map(|s| s.trim().to_string()).map_err(map_inquire_err)
    }

    fn select(&self, message: &str, options: &[String]) -> Result<usize> {
        if options.is_empty() {
            return Err(LabError::prompt(format!("{}: nothing to choose from", message)));
        }
        let answer = Select::new(message, options.to_vec())
            .prompt()
            .map_err(map_inquire_err)?;
        options
            .iter()
            .position(|o| *o == answer)
            .ok_or_else(|| LabError::prompt("selection not in option list"))
    }
}

/// Non-interactive answers: every question takes its default.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeYes;

impl Prompter for AssumeYes {
    fn confirm(&self, message: &str, _default: bool) -> Result<bool> {
        tracing::info!("--yes: answering yes to '{}'", message);
        Ok(true)
    }

    fn text(&self, message: &str, default: Option<&str>) -> Result<String> {
        default.map(str::to_string).ok_or_else(|| {
            LabError::prompt(format!(
                "'{}' needs an answer and has no default (run without --yes)",
                message
            ))
        })
    }

    fn select(&self, message: &str, options: &[String]) -> Result<usize> {
        if options.is_empty() {
            return Err(LabError::prompt(format!("{}: nothing to choose from", message)));
        }
        tracing::info!("--yes: choosing '{}' for '{}'", options[0], message);
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assume_yes_takes_defaults() {
        let p = AssumeYes;
        assert!(p.confirm("Continue?", false).unwrap());
        assert_eq!(p.text("VM name", Some("dev")).unwrap(), "dev");
        assert_eq!(p.select("Pick", &["a".into(), "b".into()]).unwrap(), 0);
    }

    #[test]
    fn test_assume_yes_refuses_questions_without_default() {
        let err = AssumeYes.text("Tunnel token", None).unwrap_err();
        assert!(matches!(err, LabError::Prompt(_)));
        assert!(AssumeYes.select("Pick", &[]).is_err());
    }

    #[test]
    fn test_cancel_maps_to_interrupted() {
        assert!(matches!(
            map_inquire_err(InquireError::OperationCanceled),
            LabError::Interrupted
        ));
    }
}
