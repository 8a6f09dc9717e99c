//! Operator notification for halts

use crate::commands::StopSignal;
use std::io::{self, BufRead, Write};
use tracing::{info, warn};

pub trait OperatorPrompt: Send {
    /// Informational notice; must not block
    fn notify(&mut self, signal: &StopSignal);

    /// Ask whether to continue past an optional halt. Blocks until answered.
    fn confirm_continue(&mut self, signal: &StopSignal) -> bool;
}

/// Asks on stderr and reads the answer from stdin
#[derive(Debug, Default)]
pub struct ConsolePrompt;

impl OperatorPrompt for ConsolePrompt {
    fn notify(&mut self, signal: &StopSignal) {
        info!("{}", signal);
    }

    fn confirm_continue(&mut self, signal: &StopSignal) -> bool {
        eprint!("{}. Continue build? [y/N] ", signal);
        let _ = io::stderr().flush();
        let mut answer = String::new();
        match io::stdin().lock().read_line(&mut answer) {
            Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            Err(e) => {
                warn!("Could not read answer: {}", e);
                false
            }
        }
    }
}

/// Fixed answer for unattended builds
#[derive(Debug, Clone)]
pub struct AutoPrompt {
    pub continue_optional: bool,
    pub notices: Vec<String>,
}

impl AutoPrompt {
    pub fn new(continue_optional: bool) -> Self {
        Self { continue_optional, notices: Vec::new() }
    }
}

impl OperatorPrompt for AutoPrompt {
    fn notify(&mut self, signal: &StopSignal) {
        info!("{}", signal);
        self.notices.push(signal.message.clone());
    }

    fn confirm_continue(&mut self, signal: &StopSignal) -> bool {
        info!("{} ({})", signal, if self.continue_optional { "continuing" } else { "stopping" });
        self.notices.push(signal.message.clone());
        self.continue_optional
    }
}
