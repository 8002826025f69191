//! Console side of the command channel
//!
//! A blocking client over `std::net::TcpStream`. Every request is one
//! round trip; the connection is dropped on any transport or decoding
//! error so a half-read response can never be mistaken for the next one.
//! A failed status alone leaves the connection usable.

use crate::domain::ClientError;
use crate::engine::ReloadProgress;
use crate::instrument::RESTORE_ALL_RULES;
use crate::remote::payload::{
    read_class_list, read_thread_infos, write_thread_request, ClassInfo, MemoryInfo, RuntimeInfo,
    ThreadInfo,
};
use crate::snapshot::{read_snapshot, Snapshot};
use callscope_common::wire::{read_bool, read_i32, read_utf, write_bool, write_i32, write_utf};
use callscope_common::{
    AGENT_VERSION, Command, PROGRESS_END, PROGRESS_FAILED, STATUS_ACK, STATUS_ERROR,
};
use log::{debug, info};
use std::io::{BufReader, BufWriter, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

struct Connection {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    peer: SocketAddr,
}

impl Connection {
    fn open(stream: TcpStream) -> Result<Self, ClientError> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let mut connection = Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: BufWriter::new(stream),
            peer,
        };

        let agent = read_utf(&mut connection.reader)?;
        if agent != AGENT_VERSION {
            return Err(ClientError::VersionMismatch {
                console: AGENT_VERSION.to_string(),
                agent,
            });
        }
        Ok(connection)
    }

    fn request(&mut self, command: Command) -> Result<(), ClientError> {
        write_i32(&mut self.writer, command.code())?;
        self.writer.flush()?;
        Ok(())
    }

    fn expect_ack(&mut self, command: Command) -> Result<(), ClientError> {
        let status = read_i32(&mut self.reader)?;
        if status == STATUS_ACK {
            Ok(())
        } else {
            Err(ClientError::CommandFailed { command: command.code(), status })
        }
    }

    /// Send `command` and wait for its acknowledgement
    fn simple(&mut self, command: Command) -> Result<(), ClientError> {
        self.request(command)?;
        self.expect_ack(command)
    }
}

/// Whether an error leaves the stream in sync with the agent
fn keeps_connection(err: &ClientError) -> bool {
    matches!(err, ClientError::CommandFailed { .. } | ClientError::AlreadyConnected)
}

#[derive(Default)]
pub struct Client {
    connection: Option<Connection>,
}

impl Client {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to the agent at `host:port` and check its version.
    ///
    /// # Errors
    /// Already connected, connection failure or an incompatible agent.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<(), ClientError> {
        if self.connection.is_some() {
            return Err(ClientError::AlreadyConnected);
        }
        let stream = TcpStream::connect((host, port))?;
        self.attach(stream)
    }

    /// [`Self::connect`] giving up after `timeout` per resolved address
    ///
    /// # Errors
    /// See [`Self::connect`].
    pub fn connect_timeout(
        &mut self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        if self.connection.is_some() {
            return Err(ClientError::AlreadyConnected);
        }
        let mut last_error = None;
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return self.attach(stream),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.map_or_else(
            || ClientError::Protocol(format!("{host} did not resolve to any address")),
            ClientError::Io,
        ))
    }

    fn attach(&mut self, stream: TcpStream) -> Result<(), ClientError> {
        let connection = Connection::open(stream)?;
        info!("Connected to {} ({AGENT_VERSION})", connection.peer);
        self.connection = Some(connection);
        Ok(())
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Address of the connected agent
    #[must_use]
    pub fn peer(&self) -> Option<SocketAddr> {
        self.connection.as_ref().map(|c| c.peer)
    }

    fn call<T>(
        &mut self,
        op: impl FnOnce(&mut Connection) -> Result<T, ClientError>,
    ) -> Result<T, ClientError> {
        let connection = self.connection.as_mut().ok_or(ClientError::NotConnected)?;
        let result = op(connection);
        if let Err(err) = &result {
            if !keeps_connection(err) {
                debug!("Dropping connection after error: {err}");
                self.connection = None;
            }
        }
        result
    }

    /// Tell the agent goodbye and close the connection.
    ///
    /// # Errors
    /// `NotConnected`, or a failed goodbye (the connection is closed anyway).
    pub fn disconnect(&mut self) -> Result<(), ClientError> {
        let result = self.call(|c| c.simple(Command::Disconnect));
        self.connection = None;
        result
    }

    /// # Errors
    /// Connection or protocol failures.
    pub fn gc(&mut self) -> Result<(), ClientError> {
        self.call(|c| c.simple(Command::Gc))
    }

    /// # Errors
    /// Connection or protocol failures.
    pub fn reset_stats(&mut self) -> Result<(), ClientError> {
        self.call(|c| c.simple(Command::ResetStats))
    }

    /// # Errors
    /// Connection failures or a malformed snapshot.
    pub fn snapshot(&mut self) -> Result<Snapshot, ClientError> {
        self.call(|c| {
            c.simple(Command::Snapshot)?;
            Ok(read_snapshot(&mut c.reader)?)
        })
    }

    /// Send new rules. `progress` receives the class count first, then the
    /// number of classes probed every 50 classes.
    ///
    /// # Errors
    /// `CommandFailed` if the agent rejected the rules or the reload aborted,
    /// connection failures.
    pub fn apply_rules(
        &mut self,
        options: &str,
        rules: &str,
        progress: &mut dyn ReloadProgress,
    ) -> Result<(), ClientError> {
        self.call(|c| {
            write_i32(&mut c.writer, Command::ApplyRules.code())?;
            write_utf(&mut c.writer, options)?;
            write_utf(&mut c.writer, rules)?;
            c.writer.flush()?;
            c.expect_ack(Command::ApplyRules)?;

            let mut first = true;
            loop {
                let value = read_i32(&mut c.reader)?;
                match value {
                    PROGRESS_END => return Ok(()),
                    PROGRESS_FAILED => {
                        return Err(ClientError::CommandFailed {
                            command: Command::ApplyRules.code(),
                            status: STATUS_ERROR,
                        });
                    }
                    _ => {}
                }
                let value = usize::try_from(value)
                    .map_err(|_| ClientError::Protocol(format!("negative progress {value}")))?;
                if first {
                    progress.set_max_value(value);
                    first = false;
                } else {
                    progress.set_value(value);
                }
            }
        })
    }

    /// Remove all instrumentation
    ///
    /// # Errors
    /// See [`Self::apply_rules`].
    pub fn restore_classes(&mut self, progress: &mut dyn ReloadProgress) -> Result<(), ClientError> {
        self.apply_rules("", RESTORE_ALL_RULES, progress)
    }

    /// # Errors
    /// Connection or protocol failures.
    pub fn list_classes(&mut self) -> Result<Vec<ClassInfo>, ClientError> {
        self.call(|c| {
            c.simple(Command::ListClasses)?;
            Ok(read_class_list(&mut c.reader)?)
        })
    }

    /// # Errors
    /// Connection or protocol failures.
    pub fn runtime_info(&mut self) -> Result<RuntimeInfo, ClientError> {
        self.call(|c| {
            c.simple(Command::GetRuntimeInfo)?;
            Ok(RuntimeInfo::read(&mut c.reader)?)
        })
    }

    /// # Errors
    /// Connection or protocol failures.
    pub fn memory_info(&mut self) -> Result<MemoryInfo, ClientError> {
        self.call(|c| {
            c.simple(Command::GetMemoryInfo)?;
            Ok(MemoryInfo::read(&mut c.reader)?)
        })
    }

    /// Threads with the given kernel ids (empty = all), stacks cut to
    /// `max_depth` frames (negative = whole stack).
    ///
    /// # Errors
    /// Connection or protocol failures.
    pub fn thread_info(
        &mut self,
        ids: &[i64],
        max_depth: i32,
    ) -> Result<Vec<ThreadInfo>, ClientError> {
        self.call(|c| {
            c.simple(Command::GetThreadInfo)?;
            write_thread_request(&mut c.writer, ids, max_depth)?;
            c.writer.flush()?;
            Ok(read_thread_infos(&mut c.reader)?)
        })
    }

    /// Request contention and CPU time monitoring; returns what the agent
    /// supports.
    ///
    /// # Errors
    /// Connection or protocol failures.
    pub fn set_thread_monitoring(
        &mut self,
        contention: bool,
        cpu_time: bool,
    ) -> Result<(bool, bool), ClientError> {
        self.call(|c| {
            write_i32(&mut c.writer, Command::SetThreadMonitoring.code())?;
            write_bool(&mut c.writer, contention)?;
            write_bool(&mut c.writer, cpu_time)?;
            c.writer.flush()?;
            Ok((read_bool(&mut c.reader)?, read_bool(&mut c.reader)?))
        })
    }
}
