//! Integration tests driving the server through the [`Client`] API.

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, sleep, JoinHandle};
use std::time::Duration;

use color_eyre::Result;
use readwrite::ReadWrite;
use serial_test::serial;

use nbdserve::proto::TransmitFlags;
use nbdserve::{Backend, Client, MemBackend, Server};

fn serve_one<B: Backend + Send + Sync + 'static>(
    server: Server<B>,
) -> (TcpStream, JoinHandle<Result<()>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        server.handle_client(stream)
    });
    let stream = TcpStream::connect(addr).unwrap();
    (stream, handle)
}

#[test]
fn write_read_round_trip() {
    let server = Server::new(MemBackend::with_size(1024 * 1024));
    let (stream, handle) = serve_one(server);

    let mut client = Client::new(stream).unwrap();
    assert_eq!(client.size(), 1024 * 1024);
    assert!(client
        .transmit_flags()
        .contains(TransmitFlags::SEND_FLUSH | TransmitFlags::SEND_WRITE_ZEROES));

    let payload: Vec<u8> = (0..8192u32).map(|i| (i % 256) as u8).collect();
    client.write(4096, &payload).unwrap();
    client.flush().unwrap();
    assert_eq!(client.read(4096, 8192).unwrap(), payload);

    // zero a slice out of the middle and check the edges survive
    client.write_zeroes(8192, 1024, true).unwrap();
    let back = client.read(4096, 8192).unwrap();
    assert_eq!(&back[..4096], &payload[..4096]);
    assert_eq!(&back[4096..5120], &[0u8; 1024]);
    assert_eq!(&back[5120..], &payload[5120..]);

    client.trim(4096, 512).unwrap();
    assert_eq!(client.read(4096, 512).unwrap(), vec![0u8; 512]);

    client.disconnect().unwrap();
    handle.join().unwrap().unwrap();
}

#[test]
fn reads_and_writes_against_readonly_server_fail() {
    let server = Server::new(MemBackend::with_size(4096)).readonly(true);
    let (stream, handle) = serve_one(server);

    let mut client = Client::new(stream).unwrap();
    assert!(client.transmit_flags().contains(TransmitFlags::READ_ONLY));
    assert!(client.read(0, 512).is_ok());
    assert!(client.write(0, &[1, 2, 3]).is_err());

    // the failed write did not desync the stream
    assert!(client.read(0, 512).is_ok());
    client.disconnect().unwrap();
    handle.join().unwrap().unwrap();
}

#[test]
fn list_reports_the_export_name() {
    let server = Server::new(MemBackend::with_size(4096)).export_name("scratch");
    let (stream, handle) = serve_one(server);

    let names = Client::list(stream).unwrap();
    assert_eq!(names, vec!["scratch".to_string()]);
    // LIST ends in an ABORT, which the server treats as a failed handshake
    assert!(handle.join().unwrap().is_err());
}

#[test]
fn session_runs_over_in_process_pipes() {
    // no sockets: splice two unidirectional pipes into a duplex stream
    let (server_rx, client_tx) = pipe::pipe();
    let (client_rx, server_tx) = pipe::pipe();
    let server_io = ReadWrite::new(server_rx, server_tx);
    let client_io = ReadWrite::new(client_rx, client_tx);

    let server = Server::new(MemBackend::with_size(65536));
    let handle = thread::spawn(move || server.handle_client(server_io));

    let mut client = Client::new(client_io).unwrap();
    client.write(0, b"piped bytes").unwrap();
    assert_eq!(client.read(0, 11).unwrap(), b"piped bytes");
    client.disconnect().unwrap();

    handle.join().unwrap().unwrap();
}

#[test]
fn parallel_sessions_share_the_backend() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(Server::new(MemBackend::with_size(4096)));

    let accept = {
        let server = Arc::clone(&server);
        thread::spawn(move || {
            let mut sessions = vec![];
            for _ in 0..2 {
                let (stream, _) = listener.accept().unwrap();
                let server = Arc::clone(&server);
                sessions.push(thread::spawn(move || server.handle_client(stream)));
            }
            for session in sessions {
                session.join().unwrap().unwrap();
            }
        })
    };

    // both sessions are live at the same time and see the same bytes
    let mut first = Client::new(TcpStream::connect(addr).unwrap()).unwrap();
    let mut second = Client::new(TcpStream::connect(addr).unwrap()).unwrap();

    first.write(0, b"shared").unwrap();
    first.flush().unwrap();
    assert_eq!(second.read(0, 6).unwrap(), b"shared");

    first.disconnect().unwrap();
    second.disconnect().unwrap();
    accept.join().unwrap();
}

/// A backend that opts out of parallel connections.
struct SerializedBackend(MemBackend);

impl Backend for SerializedBackend {
    type Handle = ();

    fn name(&self) -> &str {
        "serialized"
    }

    fn open(&self, readonly: bool) -> std::io::Result<()> {
        self.0.open(readonly)
    }

    fn get_size(&self, handle: &mut ()) -> std::io::Result<u64> {
        self.0.get_size(handle)
    }

    fn pread(&self, handle: &mut (), buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        self.0.pread(handle, buf, offset)
    }

    fn pwrite(&self, handle: &mut (), buf: &[u8], offset: u64) -> std::io::Result<()> {
        self.0.pwrite(handle, buf, offset)
    }

    fn serialize_connections(&self) -> bool {
        true
    }
}

#[test]
fn serialized_backend_serves_sessions_back_to_back() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(Server::new(SerializedBackend(MemBackend::with_size(4096))));

    let accept = {
        let server = Arc::clone(&server);
        thread::spawn(move || {
            for _ in 0..2 {
                let (stream, _) = listener.accept().unwrap();
                server.handle_client(stream).unwrap();
            }
        })
    };

    // one session at a time; the lock is released between them
    let mut first = Client::new(TcpStream::connect(addr).unwrap()).unwrap();
    first.write(100, b"once").unwrap();
    first.disconnect().unwrap();

    let mut second = Client::new(TcpStream::connect(addr).unwrap()).unwrap();
    assert_eq!(second.read(100, 4).unwrap(), b"once");
    second.disconnect().unwrap();

    accept.join().unwrap();
}

#[test]
#[serial]
fn start_accepts_clients_and_shuts_down() {
    let port = 10911;
    let server = Arc::new(Server::new(MemBackend::with_size(8192)));
    let accept = {
        let server = Arc::clone(&server);
        thread::spawn(move || server.start(port))
    };

    // wait for the listener to come up
    let mut client = None;
    for _ in 0..100 {
        match Client::connect("127.0.0.1", port) {
            Ok(c) => {
                client = Some(c);
                break;
            }
            Err(_) => sleep(Duration::from_millis(20)),
        }
    }
    let mut client = client.expect("server did not start listening");

    client.write(0, b"hello").unwrap();
    assert_eq!(client.read(0, 5).unwrap(), b"hello");
    client.disconnect().unwrap();

    server.shutdown();
    accept.join().unwrap().unwrap();
}
