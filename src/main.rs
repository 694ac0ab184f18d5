//! tether: detachable expect-style sessions on a pseudo-terminal.

use clap::Parser;
use std::fs::OpenOptions;
use std::io::{IsTerminal, Write};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tether::cli::{Cli, Command, ErrorClass, GetArgs, SOCKET_ENV, SpawnArgs};
use tether::client::{Client, ClientError, Completion, default_socket_path};
use tether::interact::{InteractConfig, InteractError, run_interact};
use tether::protocol::{ErrorCode, ExpectFlags, PassRequest, Request, Subcommand};
use tether::pty::{self, ChildPty, SpawnOptions, terminal_size};
use tether::server::{self, ExitFlag, Policies, Server, Session};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.debug {
            EnvFilter::new("tether=debug")
        } else {
            EnvFilter::new("tether=warn")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let socket_path = cli.sock.clone().unwrap_or_else(default_socket_path);

    let code = match cli.command {
        Command::Spawn(args) => run_spawn(&socket_path, &args, cli.debug),
        Command::Chkerr { errno, is } => chkerr(errno, is),
        cmd => run_client(&socket_path, cmd),
    };
    std::process::exit(i32::from(code));
}

fn fatal(code: ErrorCode, message: impl std::fmt::Display) -> u8 {
    eprintln!("[ERROR] {message} ({})", code.name());
    code.exit_status()
}

fn chkerr(errno: i32, is: ErrorClass) -> u8 {
    let wanted = match is {
        ErrorClass::Eof => ErrorCode::Eof,
        ErrorClass::Timeout => ErrorCode::Timeout,
    };
    u8::from(errno != wanted.code())
}

fn run_spawn(socket_path: &Path, args: &SpawnArgs, debug: bool) -> u8 {
    if let Err(e) = args.validate() {
        return fatal(ErrorCode::Usage, e);
    }

    let logfile = match &args.logfile {
        Some(path) => {
            let opened = OpenOptions::new()
                .create(true)
                .write(true)
                .append(args.append)
                .truncate(!args.append)
                .open(path);
            match opened {
                Ok(file) => Some(file),
                Err(e) => {
                    return fatal(ErrorCode::System, format!("cannot open {}: {e}", path.display()));
                }
            }
        }
        None => None,
    };

    let winsize = if std::io::stdin().is_terminal() {
        terminal_size(libc::STDIN_FILENO)
    } else {
        None
    };

    let listener = match server::bind(socket_path) {
        Ok(listener) => listener,
        Err(e) => return fatal(ErrorCode::General, e),
    };

    if let Err(e) = tether::daemon::daemonize(debug) {
        std::fs::remove_file(socket_path).ok();
        return fatal(ErrorCode::System, format!("daemonize: {e}"));
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            std::fs::remove_file(socket_path).ok();
            return fatal(ErrorCode::System, e);
        }
    };

    let policies = Policies {
        ttl: args.ttl.max(0),
        idle: args.idle.max(0),
        zombie_idle: args.zombie_idle,
        autowait: args.autowait,
        nonblock: args.discard,
        close_on_exit: args.close_on_exit,
        default_timeout: args.timeout,
    };
    let opts = SpawnOptions {
        nohup: args.nohup,
        term: args.term.clone(),
        winsize,
        unset_env: vec![SOCKET_ENV.to_string()],
    };

    let result = runtime.block_on(async {
        let exit_flag = ExitFlag::register().map_err(|e| format!("SIGCHLD handler: {e}"))?;
        let pty = pty::spawn(&args.cmd, &opts).map_err(|e| e.to_string())?;
        info!(pid = pty.pid(), cmd = ?args.cmd, "spawned child");
        if let Err(e) = nix::unistd::chdir("/") {
            tracing::warn!(error = %e, "chdir failed");
        }

        let mut session = Session::new(pty, policies, exit_flag, Instant::now());
        if let Some(file) = logfile {
            session = session.with_logfile(file);
        }
        let server = Server::new(socket_path.to_path_buf(), listener, session).map_err(|e| e.to_string())?;
        server.run().await.map_err(|e| e.to_string())
    });

    match result {
        Ok(_) => 0,
        Err(e) => {
            // stderr is /dev/null by now unless --debug
            std::fs::remove_file(socket_path).ok();
            error!("{e}");
            ErrorCode::System.exit_status()
        }
    }
}

/// What a client command does once connected.
enum Action {
    Request(Request),
    Get(GetArgs),
    Interact(InteractConfig),
}

fn action_for(cmd: Command) -> Result<Action, String> {
    let request = match cmd {
        Command::Expect(args) => args.request().map_err(|e| e.to_string())?,
        Command::Send(args) => Request::Send(args.payload().map_err(|e| e.to_string())?),
        Command::Interact { lookback, no_detach } => {
            return Ok(Action::Interact(InteractConfig { lookback, no_detach }));
        }
        Command::Wait => Request::Pass(PassRequest {
            subcommand: Subcommand::Wait,
            flags: ExpectFlags::EXIT,
            pattern: None,
            timeout: Some(-1),
            lookback: None,
        }),
        Command::ExpectOut { index } => Request::ExpectOut { index },
        Command::Close => Request::Close,
        Command::Kill { signal } => Request::Kill { signal },
        Command::Set(args) => args.request().map_err(|e| e.to_string())?,
        Command::Get(args) => return Ok(Action::Get(args)),
        Command::Spawn(_) | Command::Chkerr { .. } => {
            return Err("not a client command".to_string());
        }
    };
    Ok(Action::Request(request))
}

fn check_socket(path: &Path) -> Result<(), PathBuf> {
    match std::fs::metadata(path) {
        Ok(meta) if !meta.file_type().is_socket() => Err(path.to_path_buf()),
        _ => Ok(()),
    }
}

fn run_client(socket_path: &Path, cmd: Command) -> u8 {
    let action = match action_for(cmd) {
        Ok(action) => action,
        Err(e) => return fatal(ErrorCode::Usage, e),
    };
    if let Err(path) = check_socket(socket_path) {
        return fatal(ErrorCode::General, format!("not a socket file: {}", path.display()));
    }
    if matches!(action, Action::Interact(_)) && !std::io::stdin().is_terminal() {
        return fatal(ErrorCode::NoTty, "stdin is not a tty");
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => return fatal(ErrorCode::System, e),
    };
    let result = runtime.block_on(execute(socket_path, action));
    // stdin reads block a worker that would otherwise hold up shutdown
    runtime.shutdown_background();

    match result {
        Ok(code) => code,
        Err(e) => fatal(e.code(), e),
    }
}

/// Failures of a connected client command.
#[derive(Debug, thiserror::Error)]
enum CommandError {
    #[error("{0}")]
    Client(#[from] ClientError),

    #[error("{0}")]
    Interact(#[from] InteractError),

    #[error("cannot render session info: {0}")]
    Render(#[from] serde_json::Error),
}

impl CommandError {
    const fn code(&self) -> ErrorCode {
        match self {
            Self::Client(e) | Self::Interact(InteractError::Client(e)) => e.code(),
            Self::Interact(InteractError::NotATty) => ErrorCode::NoTty,
            Self::Interact(_) | Self::Render(_) => ErrorCode::System,
        }
    }
}

async fn execute(socket_path: &Path, action: Action) -> Result<u8, CommandError> {
    let client = Client::connect(socket_path).await?;
    let mut stdout = std::io::stdout();

    let completion = match action {
        Action::Request(request) => client.run(&request, &mut stdout).await?,
        Action::Interact(config) => run_interact(client, config).await?,
        Action::Get(args) => {
            let completion = client.run(&Request::Info, &mut stdout).await?;
            if let Completion::Info(info) = &completion {
                let text = args.render(info)?;
                stdout
                    .write_all(text.as_bytes())
                    .map_err(ClientError::Output)?;
            }
            completion
        }
    };

    if let Completion::Text(text) = &completion {
        stdout.write_all(text).map_err(ClientError::Output)?;
    }
    stdout.flush().map_err(ClientError::Output)?;
    Ok(completion.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chkerr() {
        assert_eq!(chkerr(206, ErrorClass::Eof), 0);
        assert_eq!(chkerr(207, ErrorClass::Eof), 1);
        assert_eq!(chkerr(207, ErrorClass::Timeout), 0);
        assert_eq!(chkerr(0, ErrorClass::Timeout), 1);
    }

    #[test]
    fn test_check_socket() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"").unwrap();
        assert_eq!(check_socket(&file), Err(file.clone()));
        assert_eq!(check_socket(&dir.path().join("missing")), Ok(()));
    }

    #[test]
    fn test_wait_request() {
        let Ok(Action::Request(Request::Pass(pass))) = action_for(Command::Wait) else {
            panic!("expected PASS");
        };
        assert_eq!(pass.subcommand, Subcommand::Wait);
        assert_eq!(pass.flags, ExpectFlags::EXIT);
        assert_eq!(pass.timeout, Some(-1));
    }
}
