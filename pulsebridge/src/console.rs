//! Terminal front end.
//!
//! Renders relay events as plain lines and turns operator input into relay
//! commands. Any line that is not a keyword is taken as a new upstream
//! address.

use std::io::{BufRead, Write};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use pulsebridge_common::{TelemetrySample, UpstreamTarget};

use crate::observer::{Observer, RelayEvent, StatusUpdate};
use crate::relay::RelayHandle;

const HELP: &str = "Commands: <address> retarget upstream | status | help | quit";

/// A parsed operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Retarget(String),
    Status,
    Help,
    Quit,
}

impl Command {
    /// Parse one input line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let command = match line.to_ascii_lowercase().as_str() {
            "status" => Self::Status,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            _ => Self::Retarget(line.to_string()),
        };
        Some(command)
    }
}

/// Why the console stopped reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleExit {
    /// The operator asked to quit.
    Quit,
    /// Input reached end of file.
    Closed,
}

/// Reads operator commands and applies them to the relay.
pub struct Console<W> {
    relay: RelayHandle,
    out: W,
}

impl<W: Write> Console<W> {
    pub fn new(relay: RelayHandle, out: W) -> Self {
        Self { relay, out }
    }

    /// Process input lines until `quit` or end of input.
    pub async fn run(mut self, mut input: mpsc::UnboundedReceiver<String>) -> ConsoleExit {
        self.print(HELP);

        while let Some(line) = input.recv().await {
            if let Some(command) = Command::parse(&line) {
                if self.execute(command) == Some(ConsoleExit::Quit) {
                    return ConsoleExit::Quit;
                }
            }
        }
        ConsoleExit::Closed
    }

    fn execute(&mut self, command: Command) -> Option<ConsoleExit> {
        match command {
            Command::Retarget(address) => match self.relay.retarget(&address) {
                Ok(target) => self.print(&format!("Switching upstream to {}", target)),
                Err(e) => self.print(&format!("Invalid address '{}': {}", address, e)),
            },
            Command::Status => {
                let status = self.status_line();
                self.print(&status);
            }
            Command::Help => self.print(HELP),
            Command::Quit => return Some(ConsoleExit::Quit),
        }
        None
    }

    fn status_line(&self) -> String {
        let link = self.relay.snapshot();
        let reading = self
            .relay
            .cache()
            .load()
            .map(|sample| sample.to_string())
            .unwrap_or_else(|| "none".to_string());
        let hub = self.relay.hub();

        format!(
            "Link: {} ({}), failures: {}, reading: {}, viewers: {} ({} authenticated)",
            link.state,
            link.target,
            link.consecutive_failures,
            reading,
            hub.subscriber_count(),
            hub.authenticated_count()
        )
    }

    fn print(&mut self, line: &str) {
        let _ = writeln!(self.out, "{}", line);
        let _ = self.out.flush();
    }
}

/// Read stdin lines on a dedicated thread.
///
/// A blocking read never holds up runtime shutdown this way. The thread ends
/// at end of input or once the receiver is dropped.
pub fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Stopped reading stdin");
                    break;
                }
            }
        }
    });
    rx
}

/// Ask for an upstream address until a valid one is entered.
///
/// Returns `None` if input ends first.
pub async fn prompt_address<W: Write>(
    input: &mut mpsc::UnboundedReceiver<String>,
    out: &mut W,
    default_port: u16,
) -> Option<UpstreamTarget> {
    loop {
        let _ = write!(out, "Upstream address (e.g. 192.168.3.168): ");
        let _ = out.flush();

        let line = input.recv().await?;
        match UpstreamTarget::parse(&line, default_port) {
            Ok(target) => return Some(target),
            Err(e) => {
                let _ = writeln!(out, "{}", e);
            }
        }
    }
}

/// Render a relay event as a console line.
pub fn render(event: &RelayEvent) -> String {
    match event {
        RelayEvent::StatusChanged(update) => render_status(update),
        RelayEvent::ReadingUpdated(sample) => render_reading(sample),
        RelayEvent::LogLine(line) => format!("  {}", line),
    }
}

fn render_status(update: &StatusUpdate) -> String {
    format!("[{}] {}: {}", update.state, update.target, update.detail)
}

fn render_reading(sample: &TelemetrySample) -> String {
    format!("Heart rate: {}", sample)
}

/// Observer printing every event to a writer (stdout by default).
pub struct ConsoleObserver<W> {
    out: Mutex<W>,
}

impl<W: Write> ConsoleObserver<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    fn emit(&self, line: &str) {
        let mut out = self.out.lock();
        let _ = writeln!(out, "{}", line);
        let _ = out.flush();
    }
}

impl ConsoleObserver<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> Observer for ConsoleObserver<W> {
    fn on_status_changed(&self, update: &StatusUpdate) {
        self.emit(&render_status(update));
    }

    fn on_reading_updated(&self, sample: &TelemetrySample) {
        self.emit(&render_reading(sample));
    }

    fn on_log_line(&self, line: &str) {
        self.emit(&render(&RelayEvent::LogLine(line.to_string())));
    }
}
