//! Interactive prompts on the terminal

use std::io::{self, BufRead, Write};

use secrecy::SecretString;

use crate::core::token_manager::Prompter;
use crate::error::{FnosError, Result};

/// Prompts on stderr and reads from stdin; passwords are not echoed
pub struct TerminalPrompter;

impl TerminalPrompter {
    fn read_line(prompt: &str) -> Result<String> {
        eprint!("{}", prompt);
        io::stderr().flush()?;

        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line)? == 0 {
            return Err(FnosError::Cancelled);
        }
        Ok(line.trim().to_string())
    }
}

impl Prompter for TerminalPrompter {
    fn server(&self) -> Result<String> {
        let server = Self::read_line("fnOS server (e.g. demo.fnos.net): ")?;
        if server.is_empty() {
            return Err(FnosError::InvalidInput("No server provided".into()));
        }
        Ok(server)
    }

    fn username(&self, server: &str) -> Result<String> {
        let username = Self::read_line(&format!("Username for {}: ", server))?;
        if username.is_empty() {
            return Err(FnosError::InvalidInput("No username provided".into()));
        }
        Ok(username)
    }

    fn password(&self, server: &str, username: &str) -> Result<SecretString> {
        let password = rpassword::prompt_password(format!("Password for {}@{}: ", username, server))?;
        if password.is_empty() {
            return Err(FnosError::InvalidInput("No password provided".into()));
        }
        Ok(SecretString::from(password))
    }
}
