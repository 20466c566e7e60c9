//! Verification helpers for testing tunnel provisioning
//!
//! Provides assertion helpers over the commands a [`crate::MockRunner`] captured

use thiserror::Error;

/// Verification error types
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("Expected a command containing '{expected}', got {actual:?}")]
    CommandMissing { expected: String, actual: Vec<String> },

    #[error("Command containing '{unexpected}' was executed: {command}")]
    UnexpectedCommand { unexpected: String, command: String },

    #[error("Expected {expected} commands, found {actual}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("Expected '{first}' to run before '{second}'")]
    OrderMismatch { first: String, second: String },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// Command execution verifier (for mock mode)
pub struct CommandVerifier {
    captured_commands: Vec<String>,
}

impl CommandVerifier {
    /// Create a new command verifier
    pub fn new(captured_commands: Vec<String>) -> Self {
        Self { captured_commands }
    }

    /// Verify that a specific command was executed
    pub fn assert_command_executed(&self, expected: &str) -> VerifyResult<()> {
        if self.position(expected).is_some() {
            Ok(())
        } else {
            Err(VerificationError::CommandMissing {
                expected: expected.to_string(),
                actual: self.captured_commands.clone(),
            })
        }
    }

    /// Verify that a command was NOT executed
    pub fn assert_command_not_executed(&self, unexpected: &str) -> VerifyResult<()> {
        match self
            .captured_commands
            .iter()
            .find(|cmd| cmd.contains(unexpected))
        {
            Some(cmd) => Err(VerificationError::UnexpectedCommand {
                unexpected: unexpected.to_string(),
                command: cmd.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Verify that the first command matching `first` ran before the first matching `second`
    pub fn assert_ordered(&self, first: &str, second: &str) -> VerifyResult<()> {
        match (self.position(first), self.position(second)) {
            (Some(a), Some(b)) if a < b => Ok(()),
            _ => Err(VerificationError::OrderMismatch {
                first: first.to_string(),
                second: second.to_string(),
            }),
        }
    }

    /// Verify the number of commands executed
    pub fn assert_command_count(&self, expected: usize) -> VerifyResult<()> {
        let actual = self.captured_commands.len();
        if actual != expected {
            Err(VerificationError::CountMismatch { expected, actual })
        } else {
            Ok(())
        }
    }

    /// Number of commands containing `pattern`
    pub fn count_matching(&self, pattern: &str) -> usize {
        self.captured_commands
            .iter()
            .filter(|cmd| cmd.contains(pattern))
            .count()
    }

    /// Get all captured commands
    pub fn captured_commands(&self) -> &[String] {
        &self.captured_commands
    }

    fn position(&self, pattern: &str) -> Option<usize> {
        self.captured_commands
            .iter()
            .position(|cmd| cmd.contains(pattern))
    }
}
