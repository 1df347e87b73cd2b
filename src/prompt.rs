//! Interactive operator prompts
//!
//! Discovery and the API-key flow read from the terminal through [`Prompter`]
//! so they can be driven by scripted answers in tests.

use inquire::{Password, PasswordDisplayMode, Text};
use crate::Result;

/// Source of operator input
pub trait Prompter: Send + Sync {
    /// Ask for a line of visible text
    fn ask(&self, message: &str) -> Result<String>;

    /// Ask for a secret; input is masked
    fn ask_secret(&self, message: &str) -> Result<String>;
}

/// Terminal prompter backed by `inquire`
pub struct InquirePrompter;

impl Prompter for InquirePrompter {
    fn ask(&self, message: &str) -> Result<String> {
        Ok(Text::new(message).prompt()?)
    }

    fn ask_secret(&self, message: &str) -> Result<String> {
        Ok(Password::new(message)
            .with_display_mode(PasswordDisplayMode::Masked)
            .without_confirmation()
            .prompt()?)
    }
}

#[cfg(test)]
pub use scripted::ScriptedPrompter;
