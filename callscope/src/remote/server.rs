//! Command server of the agent
//!
//! Runs on its own thread with a single-threaded tokio runtime. The thread
//! is marked as the engine's service thread, so nothing it does is profiled.
//!
//! ```text
//! accept ─▶ write AGENT_VERSION
//!        └─▶ loop { read i32 command ─▶ dispatch ─▶ write response }
//! ```
//!
//! One console is served at a time; further connections wait in the
//! listen backlog until the current one disconnects.

use crate::agent::{Agent, RulesOutcome};
use crate::domain::ServerError;
use crate::engine::ReloadProgress;
use crate::instrument::RuleSet;
use crate::remote::payload::{write_class_list, write_thread_infos};
use crate::snapshot;
use callscope_common::wire::{write_bool, write_utf};
use callscope_common::{
    AGENT_VERSION, Command, PROGRESS_END, PROGRESS_FAILED, STATUS_ACK, STATUS_ERROR,
    STATUS_UNKNOWN_COMMAND,
};
use log::{debug, error, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Name of the server thread
pub const SERVER_THREAD_NAME: &str = "callscope-agent";

type Reader = BufReader<OwnedReadHalf>;
type Writer = BufWriter<OwnedWriteHalf>;

/// Bind `port` (0 = any free port) and serve commands on a background thread.
///
/// # Errors
/// The port cannot be bound or the thread cannot be started.
pub fn spawn(agent: Arc<Agent>, port: u16) -> io::Result<SocketAddr> {
    let listener = std::net::TcpListener::bind(("0.0.0.0", port))?;
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;

    std::thread::Builder::new().name(SERVER_THREAD_NAME.to_string()).spawn(move || {
        agent.profiler().mark_service_thread();
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("Failed to start command server runtime: {e}");
                return;
            }
        };
        runtime.block_on(serve(agent, listener));
    })?;

    Ok(addr)
}

async fn serve(agent: Arc<Agent>, listener: std::net::TcpListener) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to register command listener: {e}");
            return;
        }
    };
    if let Ok(addr) = listener.local_addr() {
        info!("Command server listening on {addr}");
    }

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept connection: {e}");
                continue;
            }
        };
        info!("Console connected from {peer}");
        match serve_connection(&agent, stream).await {
            Ok(()) => info!("Console {peer} disconnected"),
            Err(ServerError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                info!("Connection closed by {peer}");
            }
            Err(e) => warn!("Error serving {peer}, closing connection: {e}"),
        }
    }
}

async fn serve_connection(agent: &Arc<Agent>, stream: TcpStream) -> Result<(), ServerError> {
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);

    let mut greeting = Vec::new();
    write_utf(&mut greeting, AGENT_VERSION)?;
    send(&mut writer, &greeting).await?;

    loop {
        let code = reader.read_i32().await?;
        let command = match Command::try_from(code) {
            Ok(command) => command,
            Err(code) => {
                debug!("Unknown command {code}");
                send(&mut writer, &status(STATUS_UNKNOWN_COMMAND)).await?;
                continue;
            }
        };
        debug!("Received {command:?}");

        match command {
            Command::Disconnect => {
                send(&mut writer, &status(STATUS_ACK)).await?;
                return Ok(());
            }
            Command::ApplyRules => apply_rules(agent, &mut reader, &mut writer).await?,
            Command::GetThreadInfo => thread_info(agent, &mut reader, &mut writer).await?,
            Command::SetThreadMonitoring => {
                let contention = reader.read_u8().await? != 0;
                let cpu_time = reader.read_u8().await? != 0;
                let (contention, cpu_time) = agent.set_thread_monitoring(contention, cpu_time);
                let mut out = Vec::with_capacity(2);
                write_bool(&mut out, contention)?;
                write_bool(&mut out, cpu_time)?;
                send(&mut writer, &out).await?;
            }
            simple => {
                let response = respond(agent, simple)?;
                send(&mut writer, &response).await?;
            }
        }
    }
}

/// Response of a command that takes no arguments: ack plus payload.
fn respond(agent: &Agent, command: Command) -> Result<Vec<u8>, ServerError> {
    let mut out = status(STATUS_ACK);
    match command {
        Command::Gc => {
            agent.collect_garbage();
        }
        Command::ResetStats => agent.reset_stats(),
        Command::Snapshot => {
            let snapshot = agent.snapshot();
            debug!("Sending snapshot of {} methods", snapshot.len());
            snapshot::write_snapshot(&mut out, &snapshot)?;
        }
        Command::ListClasses => write_class_list(&mut out, &agent.list_classes())?,
        Command::GetRuntimeInfo => agent.runtime_info().write(&mut out)?,
        Command::GetMemoryInfo => agent.memory_info().write(&mut out)?,
        other => {
            return Err(ServerError::Protocol(format!("{other:?} needs a dedicated handler")));
        }
    }
    Ok(out)
}

/// Progress of a reload, forwarded to the connection task
struct ChannelProgress(mpsc::UnboundedSender<i32>);

impl ChannelProgress {
    fn forward(&self, value: usize) {
        // The receiver only goes away with the connection
        let _ = self.0.send(i32::try_from(value).unwrap_or(i32::MAX));
    }
}

impl ReloadProgress for ChannelProgress {
    fn set_max_value(&mut self, max: usize) {
        self.forward(max);
    }

    fn set_value(&mut self, value: usize) {
        self.forward(value);
    }
}

async fn apply_rules(
    agent: &Arc<Agent>,
    reader: &mut Reader,
    writer: &mut Writer,
) -> Result<(), ServerError> {
    let options = read_utf(reader).await?;
    let rules = read_utf(reader).await?;
    if let Err(e) = RuleSet::parse(&options, &rules) {
        warn!("Rejected rules: {e}");
        send(writer, &status(STATUS_ERROR)).await?;
        return Ok(());
    }
    send(writer, &status(STATUS_ACK)).await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let worker = Arc::clone(agent);
    let reload = tokio::task::spawn_blocking(move || {
        let mut progress = ChannelProgress(tx);
        worker.apply_rules(&options, &rules, &mut progress)
    });

    while let Some(value) = rx.recv().await {
        send(writer, &status(value)).await?;
    }
    let outcome = reload
        .await
        .map_err(|e| ServerError::Protocol(format!("reload task failed: {e}")))?;

    let end = match outcome {
        Ok(RulesOutcome::Installed) => {
            send(writer, &status(0)).await?;
            PROGRESS_END
        }
        Ok(RulesOutcome::Reloaded(summary)) => {
            debug!("Reload finished with {} class errors", summary.errors.len());
            PROGRESS_END
        }
        Err(e) => {
            warn!("Reload aborted: {e}");
            PROGRESS_FAILED
        }
    };
    send(writer, &status(end)).await?;
    Ok(())
}

async fn thread_info(
    agent: &Agent,
    reader: &mut Reader,
    writer: &mut Writer,
) -> Result<(), ServerError> {
    send(writer, &status(STATUS_ACK)).await?;

    let count = reader.read_i32().await?;
    let count = usize::try_from(count)
        .map_err(|_| ServerError::Protocol(format!("negative thread count {count}")))?;
    let mut ids = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        ids.push(reader.read_i64().await?);
    }
    let max_depth = reader.read_i32().await?;

    let mut out = Vec::new();
    write_thread_infos(&mut out, &agent.thread_info(&ids, max_depth))?;
    send(writer, &out).await?;
    Ok(())
}

fn status(code: i32) -> Vec<u8> {
    code.to_be_bytes().to_vec()
}

async fn send(writer: &mut Writer, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

async fn read_utf(reader: &mut Reader) -> Result<String, ServerError> {
    let len = reader.read_u16().await?;
    let mut buf = vec![0u8; usize::from(len)];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|e| ServerError::Protocol(format!("invalid UTF-8 string: {e}")))
}
