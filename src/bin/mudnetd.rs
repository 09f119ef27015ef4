//! The game server executable.
//!
//! Wires the event multiplexer, the lookup channel, and a minimal
//! built-in lobby together. The lobby is deliberately small — welcome
//! text, WHO, QUIT, and in-place reboot — since real games implement
//! [`mudnet::server::service::GameService`] themselves; it exists so the
//! server runs out of the box.
//!
//! The whole server runs on a current-thread runtime: one thread drives
//! every connection, and the only other process is the lookup helper.

use std::io;
use std::os::unix::io::RawFd;
use std::os::unix::process::CommandExt;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mudnet::lookup::channel::{Config as LookupConfig, LookupChannel};
use mudnet::lookup::Handle;
use mudnet::server::config::Config;
use mudnet::server::connection::{ConnSource, Connection};
use mudnet::server::multiplexer::{EventMultiplexer, ExitReason};
use mudnet::server::reboot::{RebootRecord, RebootState};
use mudnet::server::service::{CommandOutcome, GameService};
use mudnet::server::table::ConnectionTable;

//------------ Lobby ---------------------------------------------------------

/// The built-in placeholder game.
struct Lobby;

impl GameService for Lobby {
    fn accept_new_player(
        &mut self,
        table: &mut ConnectionTable,
        handle: Handle,
        hostname: &str,
        _ip: &str,
        _source: ConnSource,
    ) {
        table.notify(handle, "Welcome to mudnet.");
        table.notify(
            handle,
            &format!("You are connecting from {hostname}."),
        );
        table.notify(handle, "Commands: WHO, SAY <text>, QUIT.");
    }

    fn dispatch_command(
        &mut self,
        table: &mut ConnectionTable,
        handle: Handle,
        line: &str,
    ) -> CommandOutcome {
        let (verb, rest) = match line.split_once(' ') {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };
        match verb.to_ascii_uppercase().as_str() {
            "QUIT" => {
                table.notify(handle, "Goodbye.");
                CommandOutcome::Disconnect
            }
            "LOGOUT" => {
                table.notify(handle, "Logged out.");
                CommandOutcome::Logout
            }
            "WHO" => {
                let listing: Vec<String> = table
                    .iter()
                    .filter(|conn| !conn.is_hidden())
                    .map(|conn| {
                        format!(
                            "  [{}] {} ({} commands)",
                            conn.handle(),
                            conn.hostname(),
                            conn.cmds()
                        )
                    })
                    .collect();
                table.notify(handle, "Connected:");
                for line in listing {
                    table.notify(handle, &line);
                }
                CommandOutcome::Continue
            }
            "SAY" if !rest.is_empty() => {
                let text = format!("[{handle}] says, \"{rest}\"");
                for other in table.handles() {
                    table.notify(other, &text);
                }
                CommandOutcome::Continue
            }
            "SHUTDOWN" => CommandOutcome::Shutdown,
            "REBOOT" => {
                for other in table.handles() {
                    table.notify(other, "Server rebooting; hold on.");
                }
                CommandOutcome::Reboot
            }
            _ => {
                table.notify(handle, "Huh? Try WHO, SAY, or QUIT.");
                CommandOutcome::Continue
            }
        }
    }

    fn process_queued_actions(
        &mut self,
        _table: &mut ConnectionTable,
        _budget: usize,
    ) -> usize {
        // The lobby keeps no action queue.
        0
    }

    fn next_action_due(&self) -> Option<std::time::Duration> {
        None
    }
}

//------------ main ----------------------------------------------------------

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // Single-threaded on purpose; see the module docs.
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("cannot start runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> io::Result<()> {
    let mut config = Config::new();
    if let Some(port) = std::env::args().nth(1) {
        let port: u16 = port.parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a port number: {port}"),
            )
        })?;
        let mut addr = config.listen_addr();
        addr.set_port(port);
        config.set_listen_addr(addr);
    }

    let mut lookup_config = LookupConfig::new();
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            lookup_config.set_slave_path(dir.join("lookup-slave"));
        }
    }

    let reboot_file = config.reboot_file().clone();
    let lookup = LookupChannel::new(lookup_config);

    let mut mux = if reboot_file.exists() {
        let state = RebootState::load_from_path(&reboot_file)?;
        std::fs::remove_file(&reboot_file)?;
        info!(
            "resuming from reboot file: {} connections",
            state.records.len()
        );
        // The descriptors in the file were kept open across our exec.
        unsafe { resume(config, state, lookup, Lobby)? }
    } else {
        EventMultiplexer::bind(config, lookup, Lobby).await?
    };

    match mux.run().await? {
        ExitReason::Shutdown => {
            info!("shutdown complete");
            Ok(())
        }
        ExitReason::Reboot => reboot(mux),
    }
}

//------------ Reboot mechanics ----------------------------------------------

/// Writes the continuity file and replaces this process with a fresh one.
fn reboot(mux: EventMultiplexer<Lobby>) -> io::Result<()> {
    let listener_fd = mux.listener_fd();
    let records: Vec<RebootRecord> = mux
        .table()
        .iter()
        .map(RebootRecord::from_connection)
        .collect();

    // The descriptors have to survive the exec.
    keep_across_exec(listener_fd)?;
    for record in &records {
        keep_across_exec(record.descriptor)?;
    }

    let state = RebootState {
        listener_fd,
        records,
    };
    state.save_to_path(mux.config().reboot_file())?;
    info!(
        "rebooting in place with {} connections",
        state.records.len()
    );
    // Dropping the multiplexer would close the very descriptors the
    // successor needs; leak it and let the exec sweep the rest away.
    std::mem::forget(mux);

    let exe = std::env::current_exe()?;
    let args: Vec<String> = std::env::args().skip(1).collect();
    // Only returns on failure.
    Err(std::process::Command::new(exe).args(args).exec())
}

/// Rebuilds a multiplexer from the reboot file's descriptors.
///
/// # Safety
///
/// Every descriptor in `state` must be an open socket this process owns
/// and nothing else may be holding it.
unsafe fn resume(
    config: Config,
    state: RebootState,
    lookup: LookupChannel,
    service: Lobby,
) -> io::Result<EventMultiplexer<Lobby>> {
    use std::os::unix::io::FromRawFd;

    let starting_quota = config.burst_ceiling();

    let listener =
        std::net::TcpListener::from_raw_fd(state.listener_fd);
    listener.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(listener)?;

    let mut mux =
        EventMultiplexer::from_parts(config, listener, lookup, service)?;

    for record in state.records {
        let stream = std::net::TcpStream::from_raw_fd(record.descriptor);
        if stream.set_nonblocking(true).is_err() {
            // The client vanished during the reboot; let it go.
            warn!(
                "descriptor {} did not survive the reboot",
                record.descriptor
            );
            continue;
        }
        let stream = tokio::net::TcpStream::from_std(stream)?;
        let handle = record.handle();
        let mut conn = Connection::new(
            handle,
            Arc::new(stream),
            record.source,
            record.addr.clone(),
            record.ip.clone(),
            starting_quota,
        );
        record.apply_to(&mut conn);
        mux.adopt_connection(conn);
        mux.table_mut().notify(handle, "Server rebooted.");
    }

    Ok(mux)
}

/// Clears close-on-exec so a descriptor survives the re-exec.
fn keep_across_exec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe {
        libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC)
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
