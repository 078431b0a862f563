//! RESP client over any async byte transport

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use embassy_time::Duration;
use embedded_io_async::{Read, Write};
use log::{debug, warn};

use super::resp::{self, Reply};
use super::{KeyValueStore, StoreError};

/// Size of each read from the transport
const READ_CHUNK: usize = 256;

/// Key-value store client speaking RESP over `T`.
///
/// One request is in flight at a time: every call writes a command and waits
/// for its reply before returning. Timeouts belong to the transport.
pub struct RespClient<T> {
    io: T,
    rx: Vec<u8>,
    tx: Vec<u8>,
}

impl<T> RespClient<T>
where
    T: Read + Write,
{
    pub fn new(io: T) -> Self {
        Self {
            io,
            rx: Vec::with_capacity(READ_CHUNK),
            tx: Vec::with_capacity(READ_CHUNK),
        }
    }

    pub fn into_inner(self) -> T {
        self.io
    }

    /// Authenticate the connection. An empty password skips the exchange.
    pub async fn auth(&mut self, password: &str) -> Result<(), StoreError> {
        if password.is_empty() {
            return Ok(());
        }
        match self.command(&["AUTH", password]).await? {
            Reply::Simple(ok) if ok == "OK" => Ok(()),
            _ => Err(StoreError::UnexpectedReply { command: "AUTH" }),
        }
    }

    /// Send one command and wait for its reply.
    ///
    /// Error replies from the server become [`StoreError::Server`].
    pub async fn command(&mut self, args: &[&str]) -> Result<Reply, StoreError> {
        self.tx.clear();
        resp::encode_command(args, &mut self.tx);
        self.io.write_all(&self.tx).await.map_err(transport)?;
        self.io.flush().await.map_err(transport)?;

        match self.read_reply().await? {
            Reply::Error(message) => {
                warn!("store: {} failed: {}", args.first().unwrap_or(&""), message);
                Err(StoreError::Server(message))
            }
            reply => Ok(reply),
        }
    }

    async fn read_reply(&mut self) -> Result<Reply, StoreError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some((reply, used)) = resp::parse_reply(&self.rx)? {
                self.rx.drain(..used);
                return Ok(reply);
            }

            let n = self.io.read(&mut chunk).await.map_err(transport)?;
            if n == 0 {
                debug!("store: connection closed mid-reply");
                return Err(StoreError::Closed);
            }
            self.rx.extend_from_slice(&chunk[..n]);
        }
    }

    async fn integer(&mut self, args: &[&str], command: &'static str) -> Result<i64, StoreError> {
        match self.command(args).await? {
            Reply::Integer(n) => Ok(n),
            _ => Err(StoreError::UnexpectedReply { command }),
        }
    }
}

impl<T> KeyValueStore for RespClient<T>
where
    T: Read + Write,
{
    async fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        match self.command(&["GET", key]).await? {
            Reply::Bulk(Some(bytes)) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| StoreError::NotUtf8),
            Reply::Bulk(None) => Ok(None),
            _ => Err(StoreError::UnexpectedReply { command: "GET" }),
        }
    }

    async fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        match self.command(&["SET", key, value]).await? {
            Reply::Simple(ok) if ok == "OK" => Ok(()),
            _ => Err(StoreError::UnexpectedReply { command: "SET" }),
        }
    }

    /// EXPIRE takes whole seconds; a partial second rounds up so a short
    /// TTL never becomes `EXPIRE key 0`.
    async fn expire(&mut self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let secs = ttl.as_micros().div_ceil(1_000_000).to_string();
        Ok(self.integer(&["EXPIRE", key, &secs], "EXPIRE").await? == 1)
    }

    async fn del(&mut self, key: &str) -> Result<bool, StoreError> {
        Ok(self.integer(&["DEL", key], "DEL").await? > 0)
    }

    async fn publish(&mut self, channel: &str, message: &str) -> Result<u32, StoreError> {
        let receivers = self.integer(&["PUBLISH", channel, message], "PUBLISH").await?;
        Ok(u32::try_from(receivers).unwrap_or(0))
    }
}

fn transport<E: embedded_io::Error>(e: E) -> StoreError {
    StoreError::Transport(e.kind())
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;
    use embassy_futures::block_on;

    /// Transport that replays canned server bytes in small chunks and
    /// records everything written.
    struct ScriptedIo {
        incoming: Vec<u8>,
        pos: usize,
        chunk: usize,
        written: Vec<u8>,
    }

    impl ScriptedIo {
        fn new(incoming: &[u8]) -> Self {
            Self {
                incoming: incoming.to_vec(),
                pos: 0,
                chunk: 3,
                written: Vec::new(),
            }
        }
    }

    impl embedded_io_async::ErrorType for ScriptedIo {
        type Error = Infallible;
    }

    impl Read for ScriptedIo {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
            let n = (self.incoming.len() - self.pos).min(buf.len()).min(self.chunk);
            buf[..n].copy_from_slice(&self.incoming[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    impl Write for ScriptedIo {
        async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        async fn flush(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    #[test]
    fn test_get_existing_and_missing() {
        let mut client = RespClient::new(ScriptedIo::new(b"$2\r\n12\r\n$-1\r\n"));

        assert_eq!(
            block_on(client.get("ezero:bootcount")),
            Ok(Some(String::from("12")))
        );
        assert_eq!(block_on(client.get("ezero:missing")), Ok(None));

        let io = client.into_inner();
        assert!(io.written.starts_with(b"*2\r\n$3\r\nGET\r\n$15\r\nezero:bootcount\r\n"));
    }

    #[test]
    fn test_set_expire_del_publish() {
        let mut client = RespClient::new(ScriptedIo::new(b"+OK\r\n:1\r\n:0\r\n:2\r\n"));

        assert_eq!(block_on(client.set("k", "v")), Ok(()));
        assert_eq!(block_on(client.expire("k", Duration::from_secs(120))), Ok(true));
        assert_eq!(block_on(client.del("k")), Ok(false));
        assert_eq!(block_on(client.publish("k", "hello")), Ok(2));

        let io = client.into_inner();
        let sent = String::from_utf8(io.written).unwrap();
        assert!(sent.contains("$6\r\nEXPIRE\r\n$1\r\nk\r\n$3\r\n120\r\n"));
    }

    #[test]
    fn test_expire_rounds_partial_seconds_up() {
        let mut client = RespClient::new(ScriptedIo::new(b":1\r\n:1\r\n"));

        assert_eq!(block_on(client.expire("k", Duration::from_millis(200))), Ok(true));
        assert_eq!(block_on(client.expire("k", Duration::from_millis(1500))), Ok(true));

        let sent = String::from_utf8(client.into_inner().written).unwrap();
        assert!(sent.contains("$6\r\nEXPIRE\r\n$1\r\nk\r\n$1\r\n1\r\n"));
        assert!(sent.contains("$6\r\nEXPIRE\r\n$1\r\nk\r\n$1\r\n2\r\n"));
        assert!(!sent.contains("$1\r\n0\r\n"));
    }

    #[test]
    fn test_server_error_reply() {
        let mut client = RespClient::new(ScriptedIo::new(b"-NOAUTH Authentication required.\r\n"));
        assert_eq!(
            block_on(client.set("k", "v")),
            Err(StoreError::Server(String::from(
                "NOAUTH Authentication required."
            )))
        );
    }

    #[test]
    fn test_auth() {
        let mut client = RespClient::new(ScriptedIo::new(b"+OK\r\n"));
        assert_eq!(block_on(client.auth("secret")), Ok(()));
        assert_eq!(block_on(client.auth("")), Ok(()));
        assert_eq!(client.into_inner().written.len(), b"*2\r\n$4\r\nAUTH\r\n$6\r\nsecret\r\n".len());
    }

    #[test]
    fn test_closed_connection() {
        let mut client = RespClient::new(ScriptedIo::new(b"$5\r\nab"));
        assert_eq!(block_on(client.get("k")), Err(StoreError::Closed));
    }

    #[test]
    fn test_unexpected_reply_type() {
        let mut client = RespClient::new(ScriptedIo::new(b":1\r\n"));
        assert_eq!(
            block_on(client.get("k")),
            Err(StoreError::UnexpectedReply { command: "GET" })
        );
    }
}
