use crate::ErrorKind;
use crate::modbus::{self, MAX_READ_COUNT, MAX_WRITE_COUNT, ModbusTCPCodec, Operation, ResponseKind};
use crate::registers::{join_u32, pack_u8_pair, split_u32, unpack_u8_pair};
use futures::{SinkExt as _, StreamExt as _};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup of `{1}` failed")]
    LookupHost(#[source] std::io::Error, String),
    #[error("could not connect to `{1}` over TCP")]
    Connect(#[source] std::io::Error, String),
    #[error("connecting to `{1}` did not complete within {0:?}")]
    ConnectTimeout(Duration, String),
    #[error("the connection is not established")]
    NotConnected,
    #[error("could not send out the request")]
    Send(#[source] std::io::Error),
    #[error("could not read data from the stream")]
    Receive(#[source] std::io::Error),
    #[error("the device closed the connection")]
    ConnectionClosed,
    #[error("no response within {0:?}")]
    ResponseTimeout(Duration),
    #[error("device responded to function {function} at register {address} with exception code {code}")]
    Exception { function: u8, address: u16, code: u8 },
    #[error("device responded with something other than what was requested ({0})")]
    UnexpectedResponse(&'static str),
    #[error("{count} registers starting at {address} do not fit the register address space")]
    AddressOverflow { address: u16, count: usize },
    #[error("could not shut down the connection")]
    Shutdown(#[source] std::io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::LookupHost(..)
            | Error::Connect(..)
            | Error::NotConnected
            | Error::Send(_)
            | Error::Receive(_)
            | Error::ConnectionClosed
            | Error::Shutdown(_) => ErrorKind::Connection,
            Error::ConnectTimeout(..) | Error::ResponseTimeout(_) => ErrorKind::Timeout,
            Error::Exception { .. } | Error::UnexpectedResponse(_) => ErrorKind::Protocol,
            Error::AddressOverflow { .. } => ErrorKind::Usage,
        }
    }
}

/// Register-level access to a device.
///
/// Implementors provide the three wire operations. Everything else (word packing, chunking of
/// large reads) is built on top of those and shared by all implementations.
pub trait Transport: Send + Sync {
    /// Read `count` (at most [`MAX_READ_COUNT`]) holding registers in a single request.
    fn read_holdings(
        &self,
        address: u16,
        count: u16,
    ) -> impl Future<Output = Result<Vec<u16>, Error>> + Send;

    fn write_holding(&self, address: u16, value: u16)
    -> impl Future<Output = Result<(), Error>> + Send;

    /// Write up to [`MAX_WRITE_COUNT`] contiguous holding registers in a single request.
    fn write_holdings(
        &self,
        address: u16,
        values: &[u16],
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn is_connected(&self) -> bool {
        true
    }

    fn reconnect(&self) -> impl Future<Output = Result<(), Error>> + Send {
        async { Ok(()) }
    }

    fn read_u16(&self, address: u16) -> impl Future<Output = Result<u16, Error>> + Send {
        async move {
            let values = self.read_holdings(address, 1).await?;
            values.first().copied().ok_or(Error::UnexpectedResponse("empty read response"))
        }
    }

    fn write_u16(&self, address: u16, value: u16) -> impl Future<Output = Result<(), Error>> + Send {
        self.write_holding(address, value)
    }

    /// Read two registers as a single value, high word first.
    fn read_u32(&self, address: u16) -> impl Future<Output = Result<u32, Error>> + Send {
        async move {
            match self.read_holdings(address, 2).await?[..] {
                [high, low] => Ok(join_u32(high, low)),
                _ => Err(Error::UnexpectedResponse("register count mismatch")),
            }
        }
    }

    fn write_u32(&self, address: u16, value: u32) -> impl Future<Output = Result<(), Error>> + Send {
        async move {
            let (high, low) = split_u32(value);
            self.write_holdings(address, &[high, low]).await
        }
    }

    /// Read a register holding two bytes, returned as `(high, low)`.
    fn read_u8_pair(&self, address: u16) -> impl Future<Output = Result<(u8, u8), Error>> + Send {
        async move { Ok(unpack_u8_pair(self.read_u16(address).await?)) }
    }

    fn write_u8_pair(
        &self,
        address: u16,
        lo: u8,
        hi: u8,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        self.write_holding(address, pack_u8_pair(hi, lo))
    }

    /// Read any number of registers, splitting the read into as many requests as necessary.
    ///
    /// Sub-requests are issued in address order and their results concatenated. A zero `count`
    /// issues no requests at all.
    fn read_many(
        &self,
        address: u16,
        count: usize,
    ) -> impl Future<Output = Result<Vec<u16>, Error>> + Send {
        async move {
            if usize::from(address) + count > usize::from(u16::MAX) + 1 {
                return Err(Error::AddressOverflow { address, count });
            }
            let mut values = Vec::with_capacity(count);
            while values.len() < count {
                // Both fit into u16 thanks to the address space check above.
                let offset = values.len() as u16;
                let chunk = (count - values.len()).min(usize::from(MAX_READ_COUNT)) as u16;
                let chunk_values = self.read_holdings(address + offset, chunk).await?;
                if chunk_values.len() != usize::from(chunk) {
                    return Err(Error::UnexpectedResponse("register count mismatch"));
                }
                values.extend(chunk_values);
            }
            Ok(values)
        }
    }
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "connection::Args")]
pub struct Args {
    /// Address of the controller's Modbus TCP interface.
    ///
    /// Commands that change settings accept this argument multiple times and apply the change to
    /// every listed device.
    #[arg(long = "host", required = true)]
    pub hosts: Vec<String>,

    #[arg(long, default_value = "502")]
    pub port: u16,

    /// The modbus unit identifier of the controller.
    #[arg(long, short = 'i', default_value = "1")]
    pub unit_id: u8,

    /// Give up connecting if the connection is not established in this amount of time.
    #[arg(long, default_value = "10s")]
    pub connect_timeout: humantime::Duration,

    /// If the modbus response isn't received in this amount of time, consider the request failed.
    #[arg(long, default_value = "20s")]
    pub read_timeout: humantime::Duration,
}

impl Args {
    pub fn endpoint_for(&self, host: &str) -> Endpoint {
        Endpoint {
            address: format!("{}:{}", host, self.port),
            unit_id: self.unit_id,
            connect_timeout: *self.connect_timeout,
            read_timeout: *self.read_timeout,
        }
    }

    pub fn endpoints(&self) -> impl Iterator<Item = Endpoint> + '_ {
        self.hosts.iter().map(|host| self.endpoint_for(host))
    }
}

/// Everything needed to establish a connection to a single device.
#[derive(Clone, Debug)]
pub struct Endpoint {
    /// `host:port` of the device.
    pub address: String,
    pub unit_id: u8,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Endpoint {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            address: format!("{host}:{port}"),
            unit_id: 1,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(20),
        }
    }
}

type TcpIo = Framed<TcpStream, ModbusTCPCodec>;

/// A Modbus TCP connection to a single controller.
///
/// Register operations may be invoked concurrently from many tasks, but only one request is ever
/// on the wire at a time: each operation holds the connection lock for its full round trip.
pub struct Connection {
    io: Mutex<Option<TcpIo>>,
    connected: AtomicBool,
    transaction_id_generator: AtomicU16,
    endpoint: Endpoint,
}

impl Connection {
    pub async fn connect(endpoint: Endpoint) -> Result<Connection, Error> {
        let io = open(&endpoint).await?;
        Ok(Self {
            io: Mutex::new(Some(io)),
            connected: AtomicBool::new(true),
            transaction_id_generator: AtomicU16::new(0),
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn new_transaction_id(&self) -> u16 {
        self.transaction_id_generator.fetch_add(1, Ordering::Relaxed)
    }

    /// Close the connection. Further operations fail with [`Error::NotConnected`] until
    /// [`Transport::reconnect`] is called.
    pub async fn disconnect(&self) -> Result<(), Error> {
        let mut guard = self.io.lock().await;
        self.connected.store(false, Ordering::Release);
        let Some(mut io) = guard.take() else {
            return Ok(());
        };
        info!(message = "disconnecting", address = self.endpoint.address.as_str());
        io.close().await.map_err(Error::Shutdown)
    }

    async fn transact(&self, operation: Operation) -> Result<ResponseKind, Error> {
        let mut guard = self.io.lock().await;
        let Some(io) = guard.as_mut() else {
            return Err(Error::NotConnected);
        };
        let transaction_id = self.new_transaction_id();
        let address = operation.address();
        let function = operation.function_code();
        let request = modbus::Request { unit_id: self.endpoint.unit_id, transaction_id, operation };
        debug!(message = "sending request", transaction_id, function, address);
        if let Err(e) = io.send(request).await {
            self.drop_connection(&mut guard, &e);
            return Err(Error::Send(e));
        }
        let response = loop {
            let next = tokio::time::timeout(self.endpoint.read_timeout, io.next()).await;
            match next {
                Err(_elapsed) => return Err(Error::ResponseTimeout(self.endpoint.read_timeout)),
                Ok(None) => {
                    warn!(
                        message = "device closed the connection",
                        address = self.endpoint.address.as_str()
                    );
                    *guard = None;
                    self.connected.store(false, Ordering::Release);
                    return Err(Error::ConnectionClosed);
                }
                Ok(Some(Err(e))) => {
                    self.drop_connection(&mut guard, &e);
                    return Err(Error::Receive(e));
                }
                Ok(Some(Ok(response))) if response.transaction_id != transaction_id => {
                    // A late response to a request that has timed out earlier.
                    debug!(
                        message = "a response we were not expecting",
                        transaction = response.transaction_id
                    );
                    continue;
                }
                Ok(Some(Ok(response))) => break response,
            }
        };
        trace!(message = "decoded a response", transaction_id, kind = ?response.kind);
        match response.kind {
            ResponseKind::Exception { function, code } => {
                Err(Error::Exception { function, address, code })
            }
            kind => Ok(kind),
        }
    }

    fn drop_connection(&self, guard: &mut Option<TcpIo>, error: &std::io::Error) {
        warn!(
            message = "connection failed, dropping it",
            address = self.endpoint.address.as_str(),
            error = (error as &dyn std::error::Error)
        );
        *guard = None;
        self.connected.store(false, Ordering::Release);
    }
}

impl Transport for Connection {
    async fn read_holdings(&self, address: u16, count: u16) -> Result<Vec<u16>, Error> {
        debug_assert!(count <= MAX_READ_COUNT, "callers should go through `read_many`");
        match self.transact(Operation::GetHoldings { address, count }).await? {
            ResponseKind::GetHoldings { values } if values.len() == usize::from(count) => {
                Ok(values)
            }
            ResponseKind::GetHoldings { .. } => {
                Err(Error::UnexpectedResponse("register count mismatch"))
            }
            _ => Err(Error::UnexpectedResponse("not a read response")),
        }
    }

    async fn write_holding(&self, address: u16, value: u16) -> Result<(), Error> {
        match self.transact(Operation::SetHolding { address, value }).await? {
            ResponseKind::SetHolding { address: a, .. } if a == address => Ok(()),
            _ => Err(Error::UnexpectedResponse("not a matching write response")),
        }
    }

    async fn write_holdings(&self, address: u16, values: &[u16]) -> Result<(), Error> {
        if values.len() > usize::from(MAX_WRITE_COUNT)
            || usize::from(address) + values.len() > usize::from(u16::MAX) + 1
        {
            return Err(Error::AddressOverflow { address, count: values.len() });
        }
        let operation = Operation::SetHoldings { address, values: values.to_vec() };
        match self.transact(operation).await? {
            ResponseKind::SetHoldings { address: a, count }
                if a == address && usize::from(count) == values.len() =>
            {
                Ok(())
            }
            _ => Err(Error::UnexpectedResponse("not a matching write response")),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn reconnect(&self) -> Result<(), Error> {
        let mut guard = self.io.lock().await;
        if let Some(mut io) = guard.take() {
            let _ignore_shutdown_failure = io.close().await;
        }
        let io = open(&self.endpoint).await?;
        *guard = Some(io);
        self.connected.store(true, Ordering::Release);
        Ok(())
    }
}

async fn open(endpoint: &Endpoint) -> Result<TcpIo, Error> {
    let address = endpoint.address.as_str();
    info!(message = "connecting...", address);
    let connect = async {
        let addresses = tokio::net::lookup_host(address)
            .await
            .map_err(|e| Error::LookupHost(e, address.to_string()))?
            .collect::<Vec<_>>();
        debug!(message = "resolved", ?addresses);
        TcpStream::connect(&*addresses).await.map_err(|e| Error::Connect(e, address.to_string()))
    };
    let socket = tokio::time::timeout(endpoint.connect_timeout, connect)
        .await
        .map_err(|_| Error::ConnectTimeout(endpoint.connect_timeout, address.to_string()))??;
    let nodelay_result = socket.set_nodelay(true);
    trace!(message = "setting nodelay", is_error = ?nodelay_result.err());
    info!(message = "connected");
    Ok(Framed::new(socket, ModbusTCPCodec {}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    /// Read one request frame, returning its MBAP header and PDU.
    async fn read_request(socket: &mut TcpStream) -> Option<([u8; 7], Vec<u8>)> {
        let mut header = [0u8; 7];
        socket.read_exact(&mut header).await.ok()?;
        let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
        let mut pdu = vec![0u8; length - 1];
        socket.read_exact(&mut pdu).await.ok()?;
        Some((header, pdu))
    }

    fn frame(header: &[u8; 7], transaction_id: u16, pdu: &[u8]) -> Vec<u8> {
        let mut reply = Vec::new();
        reply.extend(transaction_id.to_be_bytes());
        reply.extend(&header[2..4]);
        reply.extend(((pdu.len() + 1) as u16).to_be_bytes());
        reply.push(header[6]);
        reply.extend(pdu);
        reply
    }

    /// Answer reads with `address + offset`, reject reads at register 7 with exception 2 and
    /// acknowledge writes.
    fn answer(header: &[u8; 7], pdu: &[u8]) -> Vec<u8> {
        let address = u16::from_be_bytes([pdu[1], pdu[2]]);
        let mut reply_pdu = Vec::new();
        match pdu[0] {
            3 if address == 7 => reply_pdu.extend([0x83, 2]),
            3 => {
                let count = u16::from_be_bytes([pdu[3], pdu[4]]);
                reply_pdu.extend([3, (count * 2) as u8]);
                for offset in 0..count {
                    reply_pdu.extend((address + offset).to_be_bytes());
                }
            }
            _ => reply_pdu.extend(&pdu[..5]),
        }
        frame(header, u16::from_be_bytes([header[0], header[1]]), &reply_pdu)
    }

    async fn serve_one(listener: TcpListener) {
        let (mut socket, _) = listener.accept().await.unwrap();
        while let Some((header, pdu)) = read_request(&mut socket).await {
            socket.write_all(&answer(&header, &pdu)).await.unwrap();
        }
    }

    fn endpoint(listener: &TcpListener) -> Endpoint {
        Endpoint::new("127.0.0.1", listener.local_addr().unwrap().port())
    }

    async fn local_connection() -> Connection {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = endpoint(&listener);
        tokio::spawn(serve_one(listener));
        Connection::connect(endpoint).await.unwrap()
    }

    #[tokio::test]
    async fn reads_and_writes_over_tcp() {
        let connection = local_connection().await;
        assert_eq!(connection.read_holdings(100, 3).await.unwrap(), vec![100, 101, 102]);
        assert_eq!(connection.read_u32(10).await.unwrap(), (10 << 16) | 11);
        connection.write_u16(0, 1).await.unwrap();
        let error = connection.read_u16(7).await.unwrap_err();
        assert!(matches!(error, Error::Exception { function: 3, address: 7, code: 2 }));
        assert_eq!(error.kind(), ErrorKind::Protocol);
        // An exception does not take the connection down.
        assert_eq!(connection.read_u16(8).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn concurrent_operations_are_serialized() {
        let connection = std::sync::Arc::new(local_connection().await);
        let tasks = (0..8u16)
            .map(|i| {
                let connection = std::sync::Arc::clone(&connection);
                tokio::spawn(async move { connection.read_u16(200 + i).await })
            })
            .collect::<Vec<_>>();
        for (i, task) in tasks.into_iter().enumerate() {
            assert_eq!(task.await.unwrap().unwrap(), 200 + i as u16);
        }
    }

    #[tokio::test]
    async fn operations_fail_after_disconnect() {
        let connection = local_connection().await;
        connection.disconnect().await.unwrap();
        connection.disconnect().await.unwrap();
        assert!(!connection.is_connected());
        let error = connection.read_u16(1).await.unwrap_err();
        assert!(matches!(error, Error::NotConnected));
        assert_eq!(error.kind(), ErrorKind::Connection);
    }

    #[tokio::test]
    async fn dropped_connection_is_restored_by_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = endpoint(&listener);
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (header, pdu) = read_request(&mut socket).await.unwrap();
            socket.write_all(&answer(&header, &pdu)).await.unwrap();
            // Hang up in the middle of the second exchange.
            read_request(&mut socket).await.unwrap();
            drop(socket);
            serve_one(listener).await;
        });
        let connection = Connection::connect(endpoint).await.unwrap();
        assert_eq!(connection.read_u16(5).await.unwrap(), 5);
        let error = connection.read_u16(6).await.unwrap_err();
        assert!(matches!(error, Error::ConnectionClosed));
        assert!(error.kind().is_retryable());
        assert!(!connection.is_connected());
        assert!(matches!(connection.read_u16(6).await, Err(Error::NotConnected)));
        connection.reconnect().await.unwrap();
        assert!(connection.is_connected());
        assert_eq!(connection.read_u16(6).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn unanswered_request_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint { read_timeout: Duration::from_millis(100), ..endpoint(&listener) };
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await.unwrap();
            std::future::pending::<()>().await;
            drop(socket);
        });
        let connection = Connection::connect(endpoint).await.unwrap();
        let error = connection.read_u16(1).await.unwrap_err();
        assert!(matches!(
            error,
            Error::ResponseTimeout(timeout) if timeout == Duration::from_millis(100)
        ));
        assert_eq!(error.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn late_responses_are_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = endpoint(&listener);
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            while let Some((header, pdu)) = read_request(&mut socket).await {
                let transaction_id = u16::from_be_bytes([header[0], header[1]]);
                let stale = frame(&header, transaction_id.wrapping_sub(1), &[3, 2, 0xDE, 0xAD]);
                socket.write_all(&stale).await.unwrap();
                socket.write_all(&answer(&header, &pdu)).await.unwrap();
            }
        });
        let connection = Connection::connect(endpoint).await.unwrap();
        assert_eq!(connection.read_u16(40).await.unwrap(), 40);
        assert_eq!(connection.read_holdings(41, 2).await.unwrap(), vec![41, 42]);
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = endpoint(&listener);
        drop(listener);
        let result = Connection::connect(endpoint).await;
        assert!(matches!(result, Err(Error::Connect(..))));
    }

    #[tokio::test]
    async fn large_reads_are_chunked_in_order() {
        let transport = MockTransport::new();
        for address in 1000..1300u16 {
            transport.set(address, address);
        }
        let values = transport.read_many(1000, 300).await.unwrap();
        assert_eq!(values, (1000..1300).collect::<Vec<_>>());
        assert_eq!(transport.reads(), vec![(1000, 125), (1125, 125), (1250, 50)]);
    }

    #[tokio::test]
    async fn empty_read_issues_no_request() {
        let transport = MockTransport::new();
        assert!(transport.read_many(999, 0).await.unwrap().is_empty());
        assert!(transport.reads().is_empty());
    }

    #[tokio::test]
    async fn reads_past_the_address_space_are_rejected() {
        let transport = MockTransport::new();
        let error = transport.read_many(65500, 100).await.unwrap_err();
        assert!(matches!(error, Error::AddressOverflow { address: 65500, count: 100 }));
        assert!(transport.reads().is_empty());
    }

    #[tokio::test]
    async fn word_packing_helpers() {
        let transport = MockTransport::new();
        transport.write_u32(100, 0x0001_86A0).await.unwrap();
        assert_eq!(transport.get(100), 0x0001);
        assert_eq!(transport.get(101), 0x86A0);
        assert_eq!(transport.read_u32(100).await.unwrap(), 100_000);
        transport.write_u8_pair(452, 15, 6).await.unwrap();
        assert_eq!(transport.get(452), 0x060F);
        assert_eq!(transport.read_u8_pair(452).await.unwrap(), (6, 15));
    }
}
