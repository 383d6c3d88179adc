//! PTYKit Relay
//!
//! Runs a program on a fresh pseudoterminal and relays this terminal to it:
//! stdin goes to the program, its output comes back on stdout, and the host
//! window size is followed unless one was given on the command line.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc::{self, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use nix::libc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ptykit::{
    Command, Consumer, ExitStatus, SessionInfo, SessionState, SessionSupervisor,
    SupervisorConfig, WindowSize,
};

#[derive(Parser, Debug)]
#[command(name = "ptykit-relay")]
#[command(version)]
#[command(about = "Run a program on a new pseudoterminal and relay this terminal to it", long_about = None)]
struct Args {
    /// Terminal rows (default: follow the host terminal)
    #[arg(long, value_name = "ROWS")]
    rows: Option<u16>,

    /// Terminal columns (default: follow the host terminal)
    #[arg(long, value_name = "COLS")]
    cols: Option<u16>,

    /// Path to config file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Time the program gets to exit after input ends before it is terminated
    #[arg(long, value_name = "MS", default_value_t = 2000)]
    grace_ms: u64,

    /// Print a session report on stderr when the program exits
    #[arg(long, value_enum)]
    report: Option<ReportFormat>,

    /// Program and arguments (default: $SHELL)
    #[arg(trailing_var_arg = true, value_name = "PROGRAM")]
    command: Vec<String>,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum ReportFormat {
    Text,
    Json,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let args = Args::parse();
    let report = args.report;

    match run(args) {
        Ok(info) => {
            if let Some(format) = report {
                print_report(&info, format);
            }
            match info.exit.as_ref() {
                Some(exit) if exit.success => ExitCode::SUCCESS,
                Some(exit) => ExitCode::from(exit.code.unwrap_or(1).clamp(1, 255) as u8),
                None => ExitCode::FAILURE,
            }
        }
        Err(e) => {
            eprintln!("ptykit-relay: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<SessionInfo, Box<dyn std::error::Error>> {
    let config = SupervisorConfig::load(args.config.as_deref())?;
    let mut supervisor = SessionSupervisor::new(config)?;

    let command = match args.command.split_first() {
        Some((program, rest)) => Command::new(program).args(rest),
        None => Command::default_shell(),
    };

    let follow_host = args.rows.is_none() && args.cols.is_none();
    let host = host_size().unwrap_or_default();
    let mut size = WindowSize::new(args.rows.unwrap_or(host.rows), args.cols.unwrap_or(host.cols));

    let id = supervisor.start(&command, size, Box::new(StdoutConsumer::new()))?;
    tracing::info!(session = %id, %size, "relay started");

    // Restored before the report is printed
    let raw_guard = if nix::unistd::isatty(libc::STDIN_FILENO).unwrap_or(false) {
        Some(RawModeGuard::new()?)
    } else {
        None
    };

    let input = spawn_stdin_reader();
    let mut pending: VecDeque<u8> = VecDeque::new();
    let mut input_done_at: Option<Instant> = None;
    let grace = Duration::from_millis(args.grace_ms);

    while supervisor.state(id)? != SessionState::Terminated {
        loop {
            match input.try_recv() {
                Ok(chunk) => pending.extend(chunk),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if input_done_at.is_none() {
                        // End of input: send EOF to the program's line discipline
                        pending.push_back(0x04);
                        input_done_at = Some(Instant::now());
                    }
                    break;
                }
            }
        }

        if !pending.is_empty() {
            let (front, _) = pending.as_slices();
            let sent = supervisor.send(id, front)?;
            pending.drain(..sent);
        }

        if follow_host {
            if let Some(host) = host_size().filter(|h| !h.same_cells(&size)) {
                supervisor.resize(id, host)?;
                size = host;
            }
        }

        if input_done_at.is_some_and(|at| at.elapsed() >= grace) {
            supervisor.terminate(id, grace)?;
            break;
        }

        supervisor.run_once(Some(Duration::from_millis(50)))?;
    }

    supervisor.run_until_idle(Some(Duration::from_secs(1)))?;
    drop(raw_guard);
    Ok(supervisor.info(id)?)
}

fn print_report(info: &SessionInfo, format: ReportFormat) {
    match format {
        ReportFormat::Json => match serde_json::to_string_pretty(info) {
            Ok(json) => eprintln!("{}", json),
            Err(e) => eprintln!("ptykit-relay: failed to encode report: {}", e),
        },
        ReportFormat::Text => {
            let exit = info
                .exit
                .as_ref()
                .map(|e| e.description.as_str())
                .unwrap_or("unknown");
            eprintln!(
                "{} ({}) pid {}: {} [{} signals delivered]",
                info.id, info.program, info.pid, exit, info.signals_delivered
            );
        }
    }
}

/// Reads stdin on its own thread; the channel disconnects at end of input.
fn spawn_stdin_reader() -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut stdin = io::stdin().lock();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "stdin read failed");
                    break;
                }
            }
        }
    });
    rx
}

fn host_size() -> Option<WindowSize> {
    WindowSize::read_from(libc::STDOUT_FILENO)
        .ok()
        .filter(|size| size.rows > 0 && size.cols > 0)
}

/// Writes program output straight to stdout
struct StdoutConsumer {
    stdout: io::Stdout,
}

impl StdoutConsumer {
    fn new() -> Self {
        StdoutConsumer {
            stdout: io::stdout(),
        }
    }
}

impl Consumer for StdoutConsumer {
    fn on_data(&mut self, data: &[u8]) -> usize {
        let mut out = self.stdout.lock();
        if let Err(e) = out.write_all(data).and_then(|_| out.flush()) {
            // Nowhere to put it; drop rather than stall the program
            tracing::warn!(error = %e, bytes = data.len(), "stdout write failed");
        }
        data.len()
    }

    fn on_exit(&mut self, status: ExitStatus) {
        tracing::info!(%status, "program exited");
        let _ = self.stdout.flush();
    }
}

/// RAII guard for raw terminal mode
struct RawModeGuard {
    original: nix::sys::termios::Termios,
}

impl RawModeGuard {
    fn new() -> io::Result<Self> {
        use nix::sys::termios::{self, SetArg};

        let original = termios::tcgetattr(io::stdin()).map_err(io::Error::from)?;

        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);

        termios::tcsetattr(io::stdin(), SetArg::TCSANOW, &raw).map_err(io::Error::from)?;

        Ok(Self { original })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        use nix::sys::termios::{self, SetArg};
        let _ = termios::tcsetattr(io::stdin(), SetArg::TCSANOW, &self.original);
    }
}
