//! Asynchronous PostgreSQL connection.

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

use crate::buffer_set::BufferSet;
use crate::error::{Error, Result};
use crate::handler::{CollectHandler, DropHandler, TextHandler};
use crate::opts::Opts;
use crate::protocol::backend::BackendKeyData;
use crate::protocol::frontend::write_terminate;
use crate::protocol::types::TransactionStatus;
use crate::state::StateMachine;
use crate::state::action::Action;
use crate::state::connection::ConnectionStateMachine;
use crate::state::simple_query::SimpleQueryStateMachine;

/// Stream wrapper for TCP or TLS connections.
enum Stream {
    Tcp(
        BufReader<ReadHalf<TcpStream>>,
        BufWriter<WriteHalf<TcpStream>>,
    ),
    #[cfg(feature = "tokio-tls")]
    Tls(
        BufReader<ReadHalf<tokio_native_tls::TlsStream<TcpStream>>>,
        BufWriter<WriteHalf<tokio_native_tls::TlsStream<TcpStream>>>,
    ),
}

impl Stream {
    fn tcp(stream: TcpStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self::Tcp(BufReader::new(read_half), BufWriter::new(write_half))
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self {
            Stream::Tcp(reader, _) => reader.read_exact(buf).await?,
            #[cfg(feature = "tokio-tls")]
            Stream::Tls(reader, _) => reader.read_exact(buf).await?,
        };
        Ok(())
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match self {
            Stream::Tcp(_, writer) => writer.write_all(buf).await?,
            #[cfg(feature = "tokio-tls")]
            Stream::Tls(_, writer) => writer.write_all(buf).await?,
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        match self {
            Stream::Tcp(_, writer) => writer.flush().await?,
            #[cfg(feature = "tokio-tls")]
            Stream::Tls(_, writer) => writer.flush().await?,
        }
        Ok(())
    }
}

/// Read a single full message from the stream into the buffer set.
async fn read_message_into(stream: &mut Stream, buffer_set: &mut BufferSet) -> Result<()> {
    let mut type_byte = [0u8; 1];
    stream.read_exact(&mut type_byte).await?;
    buffer_set.type_byte = type_byte[0];

    let mut length_bytes = [0u8; 4];
    stream.read_exact(&mut length_bytes).await?;
    let length = i32::from_be_bytes(length_bytes);
    if length < 4 {
        return Err(Error::Protocol(format!("invalid message length: {length}")));
    }

    let payload_len = (length - 4) as usize;
    buffer_set.read_buffer.clear();
    buffer_set.read_buffer.resize(payload_len, 0);
    stream.read_exact(&mut buffer_set.read_buffer).await?;
    Ok(())
}

/// Drive any sans-I/O `StateMachine` to completion over an async stream.
async fn drive<S: StateMachine>(
    stream: &mut Stream,
    buffer_set: &mut BufferSet,
    state_machine: &mut S,
) -> Result<()> {
    loop {
        let action = state_machine.step(buffer_set)?;
        match action {
            Action::Write => {
                stream.write_all(&buffer_set.write_buffer).await?;
                stream.flush().await?;
            }
            Action::WriteAndReadMessage => {
                stream.write_all(&buffer_set.write_buffer).await?;
                stream.flush().await?;
                read_message_into(stream, buffer_set).await?;
            }
            Action::WriteAndReadByte => {
                stream.write_all(&buffer_set.write_buffer).await?;
                stream.flush().await?;
                let mut byte = [0u8; 1];
                stream.read_exact(&mut byte).await?;
                let _ = byte;
            }
            Action::ReadMessage => {
                read_message_into(stream, buffer_set).await?;
            }
            Action::TlsHandshake => {
                return Err(Error::Unsupported("TLS handshake not available".into()));
            }
            Action::HandleAsyncMessageAndReadMessage(_msg) => {
                read_message_into(stream, buffer_set).await?;
            }
            Action::Finished => return Ok(()),
        }
    }
}

/// Asynchronous PostgreSQL connection.
pub struct Conn {
    stream: Stream,
    buffer_set: BufferSet,
    backend_key: Option<BackendKeyData>,
    server_params: Vec<(String, String)>,
    transaction_status: TransactionStatus,
    is_broken: bool,
}

impl Conn {
    /// Connect to a PostgreSQL server over TCP and complete startup/auth.
    pub async fn connect(host: &str, port: u16, options: Opts) -> Result<Self> {
        let addr = format!("{host}:{port}");
        let tcp = TcpStream::connect(&addr).await?;
        tcp.set_nodelay(true)?;
        Self::connect_with_stream(Stream::tcp(tcp), options).await
    }

    async fn connect_with_stream(stream: Stream, options: Opts) -> Result<Self> {
        let mut buffer_set = BufferSet::new();
        let mut state_machine = ConnectionStateMachine::new(options);
        let mut stream = stream;

        drive(&mut stream, &mut buffer_set, &mut state_machine).await?;

        Ok(Self {
            stream,
            buffer_set,
            backend_key: state_machine.backend_key().copied(),
            server_params: state_machine.take_server_params(),
            transaction_status: state_machine.transaction_status(),
            is_broken: false,
        })
    }

    /// Backend key data, usable for a cancellation request on a new connection.
    pub fn backend_key(&self) -> Option<&BackendKeyData> {
        self.backend_key.as_ref()
    }

    /// All server parameters observed since startup.
    pub fn server_params(&self) -> &[(String, String)] {
        &self.server_params
    }

    /// Look up a single server parameter by name.
    pub fn get_param(&self, name: &str) -> Option<&str> {
        self.server_params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Transaction status observed at the last completed `ReadyForQuery`.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Whether the connection is currently inside a transaction block.
    pub fn in_transaction(&self) -> bool {
        self.transaction_status.in_transaction()
    }

    /// Whether a prior error has left this connection unusable.
    pub fn is_broken(&self) -> bool {
        self.is_broken
    }

    /// Run a Simple-Query-protocol statement, feeding rows to `handler`.
    pub async fn query<H: TextHandler>(&mut self, sql: &str, handler: &mut H) -> Result<()> {
        let result = self.query_inner(sql, handler).await;
        if let Err(ref e) = result
            && e.is_connection_broken()
        {
            self.is_broken = true;
        }
        result
    }

    async fn query_inner<H: TextHandler>(&mut self, sql: &str, handler: &mut H) -> Result<()> {
        let mut state_machine = SimpleQueryStateMachine::new(handler, sql, &mut self.buffer_set);
        drive(&mut self.stream, &mut self.buffer_set, &mut state_machine).await?;
        self.transaction_status = state_machine.transaction_status();
        Ok(())
    }

    /// Run a statement and discard any rows, reporting rows-affected if known.
    pub async fn query_drop(&mut self, sql: &str) -> Result<Option<u64>> {
        let mut handler = DropHandler::new();
        self.query(sql, &mut handler).await?;
        Ok(handler.rows_affected())
    }

    /// Run a statement and collect all rows as a typed `Vec<T>`.
    pub async fn query_collect<T: for<'a> crate::conversion::FromRow<'a>>(
        &mut self,
        sql: &str,
    ) -> Result<Vec<T>> {
        let mut handler = CollectHandler::<T>::new();
        self.query(sql, &mut handler).await?;
        Ok(handler.into_rows())
    }

    /// Access the raw `BufferSet`/stream pair so pipeline scheduling code can
    /// drive extended-query state machines directly.
    pub(crate) async fn drive_extended<S: StateMachine>(
        &mut self,
        state_machine: &mut S,
    ) -> Result<()> {
        let result = drive(&mut self.stream, &mut self.buffer_set, state_machine).await;
        self.transaction_status = state_machine.transaction_status();
        if let Err(ref e) = result
            && e.is_connection_broken()
        {
            self.is_broken = true;
        }
        result
    }

    /// Run a transactional command pipeline to completion.
    ///
    /// Resolves to the pipeline's last result set alongside the last
    /// unhandled failure recorded, if any; individual node failures are
    /// delivered to their own `on_error` callbacks as the pipeline runs,
    /// whether or not the second element is `Some`. A successful pipeline
    /// delivers `(result_set, None)`; one that failed delivers whatever
    /// (possibly partial) result set was collected before the failure,
    /// alongside `Some(error)`.
    ///
    /// The returned future is not `Send`: a `Transaction` is built on
    /// `Rc<RefCell<_>>` and belongs to a single connection, so this cannot
    /// be awaited across a task boundary that requires `Send`.
    pub async fn run(
        &mut self,
        tx: &crate::command::Transaction,
    ) -> Result<(crate::resultset::ResultSet, Option<std::rc::Rc<Error>>)> {
        let mut scheduler = crate::scheduler::Scheduler::new(tx);
        self.drive_extended(&mut scheduler).await?;
        Ok((scheduler.last_result(), scheduler.pending_error()))
    }

    /// Gracefully terminate the connection.
    pub async fn close(mut self) -> Result<()> {
        let mut buf = Vec::new();
        write_terminate(&mut buf);
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }
}
