// Terminal: console output for the dispatcher CLI, and the Ctrl-C hook that
// starts host shutdown.

use crate::host_context::{HostContext, ShutdownReason};
use crate::tracing::Tracing;

use std::io::{self, Write};
use std::sync::Arc;
use testfork_sdk::TraceWriter;

/// Console color codes for terminal output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleColor {
    Red,
    Green,
    Yellow,
    Cyan,
    Default,
}

impl ConsoleColor {
    fn ansi_code(&self) -> &'static str {
        match self {
            ConsoleColor::Red => "\x1b[31m",
            ConsoleColor::Green => "\x1b[32m",
            ConsoleColor::Yellow => "\x1b[33m",
            ConsoleColor::Cyan => "\x1b[36m",
            ConsoleColor::Default => "",
        }
    }

    fn reset() -> &'static str {
        "\x1b[0m"
    }
}

/// Console writer. Every line is also traced at verbose level so the log
/// holds what the user saw.
#[derive(Default)]
pub struct Terminal {
    /// Suppress console output (traces are still written).
    pub silent: bool,
    trace: Option<Tracing>,
}

impl Terminal {
    pub fn new() -> Self {
        Self::default()
    }

    /// A terminal that prints nothing.
    pub fn silent() -> Self {
        Self {
            silent: true,
            trace: None,
        }
    }

    /// Attach tracing and route Ctrl-C to [`HostContext::shutdown`].
    pub fn initialize(&mut self, context: &Arc<HostContext>) {
        let trace = context.get_trace("Terminal");
        let handler_context = Arc::clone(context);
        if let Err(e) = ctrlc::set_handler(move || {
            handler_context.shutdown(ShutdownReason::UserCancelled);
        }) {
            trace.warning(&format!("Could not install Ctrl-C handler: {e}"));
        }
        self.trace = Some(trace);
    }

    pub fn write_line(&self, line: &str, color: Option<ConsoleColor>) {
        if let Some(ref trace) = self.trace {
            trace.verbose(&format!("WRITE LINE: {}", line));
        }

        if !self.silent {
            match color {
                Some(color) => println!("{}{}{}", color.ansi_code(), line, ConsoleColor::reset()),
                None => println!("{}", line),
            }
            let _ = io::stdout().flush();
        }
    }

    /// Write an error line to stderr.
    pub fn write_error(&self, line: &str) {
        if let Some(ref trace) = self.trace {
            trace.error(&format!("WRITE ERROR: {}", line));
        }

        if !self.silent {
            eprintln!("{}{}{}", ConsoleColor::Red.ansi_code(), line, ConsoleColor::reset());
        }
    }

    pub fn write_section(&self, message: &str) {
        if !self.silent {
            println!();
            println!("# {}", message);
            println!();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_terminal_accepts_writes() {
        let terminal = Terminal::silent();
        terminal.write_line("A PASSED", Some(ConsoleColor::Green));
        terminal.write_error("B FAILED");
        terminal.write_section("Summary");
        assert!(terminal.silent);
    }

    #[test]
    fn colors_wrap_in_reset() {
        assert_eq!(ConsoleColor::Default.ansi_code(), "");
        assert!(ConsoleColor::Red.ansi_code().starts_with("\x1b["));
        assert_eq!(ConsoleColor::reset(), "\x1b[0m");
    }
}
