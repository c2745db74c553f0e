//! TCP transport to the remote store

use std::io;
use std::net::{SocketAddr, TcpStream};

use tracing::{debug, info};

use treesync_core::{StreamTransport, Transport};

/// Blocking TCP connection to the store
#[derive(Debug)]
pub struct TcpTransport {
    stream: StreamTransport<TcpStream>,
    peer: SocketAddr,
}

impl TcpTransport {
    /// Connect to `server` (`host:port`) on behalf of client `name`
    ///
    /// # Errors
    /// Returns an error if the address does not resolve or the connection fails
    pub fn connect(name: &str, server: &str) -> io::Result<Self> {
        debug!("{name}: connecting to {server}");
        let stream = TcpStream::connect(server)?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        info!("{name}: connected to {peer}");

        Ok(Self {
            stream: StreamTransport::new(stream),
            peer,
        })
    }

    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.send(data)
    }

    fn recv(&mut self, len: usize) -> io::Result<Vec<u8>> {
        self.stream.recv(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use treesync_core::protocol::{HEADER_LEN, Header, LOGIN_BODY_LEN, LoginBody};
    use treesync_core::{ContentHash, Op, ProtocolClient, Status};

    #[test]
    fn test_login_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut request = [0u8; HEADER_LEN + LOGIN_BODY_LEN];
            conn.read_exact(&mut request).unwrap();
            conn.write_all(&Header::response(Op::Login, Status::Ok, 7).encode())
                .unwrap();
            LoginBody::decode(&request[HEADER_LEN..]).unwrap()
        });

        let transport = TcpTransport::connect("test", &addr.to_string()).unwrap();
        assert_eq!(transport.peer_addr(), addr);
        let client =
            ProtocolClient::login(transport, "alice", &ContentHash::from_bytes(b"secret")).unwrap();
        assert_eq!(client.client_id(), 7);

        let login = server.join().unwrap();
        assert_eq!(login.user_name(), b"alice");
        assert_eq!(login.passwd_hash, ContentHash::from_bytes(b"secret"));
    }

    #[test]
    fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(TcpTransport::connect("test", &addr.to_string()).is_err());
    }
}
