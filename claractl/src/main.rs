//! `claractl` — thin command-line client for the clarad control socket.
//!
//! Each subcommand opens the control socket, writes one request line,
//! reads one response line, prints it, and exits. Exit codes: `0` on
//! success, `1` when the daemon is unreachable, `2` when the daemon
//! reports an error.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};

/// Default control socket path of the daemon.
const DEFAULT_SOCKET: &str = "/data/clara/orchestrator.sock";

/// Response read deadline.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "claractl")]
#[command(about = "Control client for the CLARA core daemon")]
#[command(version)]
struct Cli {
    /// Path of the daemon control socket.
    #[arg(long, default_value = DEFAULT_SOCKET)]
    socket: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Overall daemon status.
    Status,
    /// List supervised services.
    Services,
    /// Start a service.
    Start { service: String },
    /// Stop a service.
    Stop { service: String },
    /// Restart a service.
    Restart { service: String },
    /// Trigger a full scan.
    Scan,
    /// Recent threats.
    Threats,
    /// Blocked tracker statistics.
    Trackers,
    /// Lock an application.
    Lock { package: String },
    /// Unlock an application.
    Unlock { package: String },
    /// Hide root from an application.
    Hide { package: String },
    /// Stop hiding root from an application.
    Unhide { package: String },
    /// Trust record for a package.
    Trust { package: String },
    /// Whitelist a package on or off.
    Whitelist {
        package: String,
        /// `on` or `off`.
        state: String,
    },
    /// Packages currently in quarantine.
    Quarantined,
}

impl Command {
    /// The request line sent to the daemon.
    fn request_line(&self) -> String {
        match self {
            Self::Status => "status".to_owned(),
            Self::Services => "services".to_owned(),
            Self::Start { service } => format!("start {service}"),
            Self::Stop { service } => format!("stop {service}"),
            Self::Restart { service } => format!("restart {service}"),
            Self::Scan => "scan".to_owned(),
            Self::Threats => "threats".to_owned(),
            Self::Trackers => "trackers".to_owned(),
            Self::Lock { package } => format!("lock {package}"),
            Self::Unlock { package } => format!("unlock {package}"),
            Self::Hide { package } => format!("hide {package}"),
            Self::Unhide { package } => format!("unhide {package}"),
            Self::Trust { package } => format!("trust {package}"),
            Self::Whitelist { package, state } => format!("whitelist {package} {state}"),
            Self::Quarantined => "quarantined".to_owned(),
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let response = match send_command(&cli.socket, &cli.command.request_line()) {
        Ok(response) => response,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(1);
        }
    };

    println!("{response}");

    if server_reported_error(&response) {
        return ExitCode::from(2);
    }
    ExitCode::SUCCESS
}

/// One request/response exchange over the control socket.
fn send_command(socket: &str, line: &str) -> anyhow::Result<String> {
    let stream = UnixStream::connect(socket)
        .map_err(|e| anyhow::anyhow!("cannot connect to {socket}: {e} (is clarad running?)"))?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;

    let mut writer = stream.try_clone()?;
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()?;

    let mut response = String::new();
    BufReader::new(stream).read_line(&mut response)?;
    if response.is_empty() {
        anyhow::bail!("daemon closed the connection without a response");
    }
    Ok(response.trim_end().to_owned())
}

/// Whether the response carries a server-side error.
fn server_reported_error(response: &str) -> bool {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(response) else {
        return false;
    };
    if value.get("error").is_some() {
        return true;
    }
    matches!(value.get("success"), Some(serde_json::Value::Bool(false)))
}
