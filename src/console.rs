//! Interactive command loop.
//!
//! Stdin is read on its own thread and handed over a channel, so the loop can
//! notice Ctrl+C between lines and return normally, dropping (and closing) the bus.

use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::debug;

use crate::bus::CanBus;
use crate::command::{self, Command, HELP};
use crate::error::CommandError;
use crate::scanner::ScanResult;
use crate::sequencer::Sequencer;
use crate::session::{display_address, SessionState};

const INTERRUPT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub struct Console<B: CanBus, W: Write> {
    bus: B,
    session: SessionState,
    sequencer: Sequencer,
    out: W,
}

impl<B: CanBus, W: Write> Console<B, W> {
    pub fn new(bus: B, session: SessionState, sequencer: Sequencer, out: W) -> Self {
        Console {
            bus,
            session,
            sequencer,
            out,
        }
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Parses and runs one line. Command errors are reported and swallowed;
    /// only a failure to write to the console comes back as an error.
    pub fn handle_line(&mut self, line: &str) -> io::Result<Flow> {
        let result = command::parse(line).and_then(|command| match command {
            Some(command) => self.execute(command),
            None => Ok(Flow::Continue),
        });
        match result {
            Ok(flow) => Ok(flow),
            Err(CommandError::Io(e)) => Err(e),
            Err(e @ CommandError::UnknownCommand(_)) => {
                writeln!(self.out, "{e}")?;
                writeln!(self.out, "{HELP}")?;
                Ok(Flow::Continue)
            }
            Err(e) => {
                writeln!(self.out, "{e}")?;
                Ok(Flow::Continue)
            }
        }
    }

    pub fn execute(&mut self, command: Command) -> Result<Flow, CommandError> {
        debug!("Executing {:?}", command);
        match command {
            Command::Scan => {
                let result = self.sequencer.scan(&mut self.bus, &mut self.session);
                self.report_scan(&result)?;
            }
            Command::SetLimit(None) => {
                writeln!(
                    self.out,
                    "CSP velocity limit (current): {:.3} rad/s",
                    self.session.velocity_limit
                )?;
                writeln!(self.out, "usage: L <rad_s>")?;
            }
            Command::SetLimit(Some(value)) => {
                match self
                    .sequencer
                    .set_velocity_limit(&mut self.bus, &mut self.session, value)
                {
                    Ok(applied) => writeln!(self.out, "CSP velocity limit: {applied:.3} rad/s -> OK")?,
                    Err(CommandError::Transport(e)) => writeln!(
                        self.out,
                        "CSP velocity limit: {:.3} rad/s -> NG ({e})",
                        value.max(0.0)
                    )?,
                    Err(e) => return Err(e),
                }
            }
            Command::MoveToAngle(degrees) => {
                let report = self
                    .sequencer
                    .move_to_angle(&mut self.bus, &self.session, degrees)?;
                writeln!(
                    self.out,
                    "A: {:.3} deg ({:.6} rad) / limit={:.3} rad/s -> {}",
                    report.degrees,
                    report.radians,
                    report.limit,
                    if report.all_sent() { "OK" } else { "NG" }
                )?;
                for (step, e) in &report.failed_sends {
                    writeln!(self.out, "  {step}: {e}")?;
                }
            }
            Command::SetAddress(new_address) => {
                let result = self
                    .sequencer
                    .set_device_address(&mut self.bus, &mut self.session, new_address)?;
                self.report_scan(&result)?;
            }
            Command::Help => writeln!(self.out, "{HELP}")?,
            Command::Quit => {
                writeln!(self.out, "Exiting.")?;
                return Ok(Flow::Quit);
            }
        }
        Ok(Flow::Continue)
    }

    fn report_scan(&mut self, result: &ScanResult) -> io::Result<()> {
        if !result.found() {
            writeln!(self.out, "{}", CommandError::NoResponse(result.window))?;
        }
        writeln!(
            self.out,
            "current_id={}",
            display_address(self.session.current_address)
        )
    }

    /// Runs until `Q`, end of input, or `interrupted` is set.
    pub fn run(&mut self, interrupted: Arc<AtomicBool>) -> io::Result<()> {
        let (lines, ready) = spawn_reader();
        loop {
            if ready.send(()).is_err() {
                break;
            }
            let line = loop {
                if interrupted.load(Ordering::SeqCst) {
                    writeln!(self.out, "\nInterrupted (Ctrl+C)")?;
                    return Ok(());
                }
                match lines.recv_timeout(INTERRUPT_POLL) {
                    Ok(line) => break Some(line),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break None,
                }
            };
            let Some(line) = line else {
                break;
            };
            if self.handle_line(&line)? == Flow::Quit {
                break;
            }
            if interrupted.load(Ordering::SeqCst) {
                writeln!(self.out, "\nInterrupted (Ctrl+C)")?;
                break;
            }
        }
        Ok(())
    }
}

/// Prompts and reads one stdin line each time `ready` fires.
fn spawn_reader() -> (Receiver<String>, Sender<()>) {
    let (line_tx, line_rx) = bounded::<String>(1);
    let (ready_tx, ready_rx) = bounded::<()>(1);
    thread::spawn(move || {
        let stdin = io::stdin();
        let mut input = stdin.lock();
        while ready_rx.recv().is_ok() {
            print!("> ");
            if io::stdout().flush().is_err() {
                break;
            }
            let mut line = String::new();
            match input.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if line_tx.send(line.trim().to_string()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    (line_rx, ready_tx)
}
