mod common;

use common::{init_logging, spawn_loop, wait_until};
use netloop::net::socket;
use netloop::{Acceptor, TcpConnection, TcpConnectionPtr};

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// The owning collaborator the reactor core expects above it: accepts
/// descriptors, wraps them in connections, keeps the registry, and tears
/// connections down when their close callback fires.
struct Server {
    handle: netloop::LoopHandle,
    join: JoinHandle<()>,
    addr: SocketAddr,
    connections: Arc<Mutex<HashMap<String, TcpConnectionPtr>>>,
    acceptor: Arc<Mutex<Option<Arc<Acceptor>>>>,
}

impl Server {
    fn start(configure: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static) -> Self {
        let listen_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let connections: Arc<Mutex<HashMap<String, TcpConnectionPtr>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let acceptor_slot: Arc<Mutex<Option<Arc<Acceptor>>>> = Arc::new(Mutex::new(None));
        let bound = Arc::new(Mutex::new(None));
        let configure = Arc::new(configure);

        let connections_setup = connections.clone();
        let acceptor_setup = acceptor_slot.clone();
        let bound_setup = bound.clone();
        let (handle, join) = spawn_loop(move |event_loop| {
            let loop_handle = event_loop.handle();
            let acceptor = Acceptor::new(loop_handle.clone(), &listen_addr);

            let registry = connections_setup.clone();
            let conn_handle = loop_handle.clone();
            let next_id = AtomicUsize::new(0);
            acceptor.set_new_connection_callback(move |connection_fd, peer_addr| {
                let name = format!("conn-{}", next_id.fetch_add(1, Ordering::SeqCst));
                let local_addr = socket::local_addr(connection_fd).expect("local addr");
                let conn = TcpConnection::new(
                    conn_handle.clone(),
                    name.clone(),
                    connection_fd,
                    local_addr,
                    peer_addr,
                );
                configure(&conn);

                let registry_close = registry.clone();
                let destroy_handle = conn_handle.clone();
                conn.set_close_callback(move |conn| {
                    registry_close.lock().unwrap().remove(conn.name());
                    let conn = conn.clone();
                    destroy_handle.queue_in_loop(move || conn.connect_destroyed());
                });

                registry.lock().unwrap().insert(name, conn.clone());
                conn.connect_established();
            });

            acceptor.listen();
            *bound_setup.lock().unwrap() = Some(acceptor.listen_addr().expect("listen addr"));
            *acceptor_setup.lock().unwrap() = Some(acceptor);
        });

        assert!(wait_until(Duration::from_secs(2), || {
            bound.lock().unwrap().is_some()
        }));
        let addr = bound.lock().unwrap().unwrap();

        Server {
            handle,
            join,
            addr,
            connections,
            acceptor: acceptor_slot,
        }
    }

    fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    fn first_connection(&self) -> TcpConnectionPtr {
        assert!(wait_until(Duration::from_secs(2), || {
            self.connection_count() == 1
        }));
        self.connections
            .lock()
            .unwrap()
            .values()
            .next()
            .expect("no connection")
            .clone()
    }

    fn shut_down(self) {
        let acceptor = self.acceptor;
        let connections = self.connections;
        let handle = self.handle.clone();
        self.handle.queue_in_loop(move || {
            let remaining: Vec<_> = connections.lock().unwrap().drain().collect();
            for (_, conn) in remaining {
                conn.connect_destroyed();
            }
            acceptor.lock().unwrap().take();
            handle.quit();
        });
        self.join.join().expect("loop thread panicked");
    }
}

fn read_exact_total(client: &mut TcpStream, mut remaining: usize) -> usize {
    let mut chunk = vec![0u8; 64 * 1024];
    let mut total = 0;
    while remaining > 0 {
        match client.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                remaining -= n.min(remaining);
            }
            Err(err) => panic!("client read failed: {}", err),
        }
    }
    total
}

#[test]
fn establishes_and_echoes() {
    init_logging();
    let established = Arc::new(AtomicUsize::new(0));
    let established_clone = established.clone();

    let server = Server::start(move |conn| {
        let established = established_clone.clone();
        conn.set_connection_callback(move |conn| {
            if conn.connected() {
                established.fetch_add(1, Ordering::SeqCst);
            }
        });
        conn.set_message_callback(|conn, input| {
            let bytes = input.retrieve_all_as_bytes();
            conn.send(&bytes);
        });
    });

    let mut client = TcpStream::connect(server.addr).expect("connect");
    client.write_all(b"hello reactor").expect("write");

    let mut buf = [0u8; 13];
    client.read_exact(&mut buf).expect("read_exact");
    assert_eq!(&buf, b"hello reactor");
    assert_eq!(established.load(Ordering::SeqCst), 1);

    let conn = server.first_connection();
    assert!(conn.connected());
    assert!(!conn.disconnected());

    // Orderly client close drives the connection through its close path
    // and out of the registry.
    drop(client);
    assert!(wait_until(Duration::from_secs(2), || {
        server.connection_count() == 0
    }));
    assert!(conn.disconnected());

    server.shut_down();
}

#[test]
fn partial_write_stages_remainder_and_drains() {
    init_logging();
    const PAYLOAD: usize = 8 * 1024 * 1024;

    let write_completes = Arc::new(AtomicUsize::new(0));
    let high_water_hits = Arc::new(Mutex::new(Vec::new()));

    let write_completes_clone = write_completes.clone();
    let high_water_clone = high_water_hits.clone();
    let server = Server::start(move |conn| {
        let write_completes = write_completes_clone.clone();
        conn.set_write_complete_callback(move |_| {
            write_completes.fetch_add(1, Ordering::SeqCst);
        });
        let high_water = high_water_clone.clone();
        conn.set_high_water_mark_callback(
            move |_, queued| {
                high_water.lock().unwrap().push(queued);
            },
            64 * 1024,
        );
        conn.set_message_callback(|conn, input| {
            input.retrieve_all();
            // Far more than the kernel accepts in one write: the remainder
            // must be staged and drained by writable events.
            conn.send(&vec![0xAB; PAYLOAD]);
        });
    });

    let mut client = TcpStream::connect(server.addr).expect("connect");
    client.write_all(b"go").expect("write trigger");

    let total = read_exact_total(&mut client, PAYLOAD);
    assert_eq!(total, PAYLOAD, "client must receive the whole payload");

    assert!(wait_until(Duration::from_secs(2), || {
        write_completes.load(Ordering::SeqCst) >= 1
    }));

    // The staged remainder crossed the 64 KiB threshold exactly once.
    let hits = high_water_hits.lock().unwrap().clone();
    assert_eq!(hits.len(), 1);
    assert!(hits[0] >= 64 * 1024);

    drop(client);
    assert!(wait_until(Duration::from_secs(2), || {
        server.connection_count() == 0
    }));
    server.shut_down();
}

#[test]
fn shutdown_defers_half_close_until_output_drains() {
    init_logging();
    const PAYLOAD: usize = 8 * 1024 * 1024;

    let server = Server::start(|conn| {
        conn.set_message_callback(|conn, input| {
            input.retrieve_all();
            conn.send(&vec![0x5A; PAYLOAD]);
            // Output is still staged: the write half must only shut down
            // once the peer has received every byte.
            conn.shutdown();
        });
    });

    let mut client = TcpStream::connect(server.addr).expect("connect");
    client.write_all(b"go").expect("write trigger");

    let mut total = 0usize;
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        match client.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(err) => panic!("client read failed: {}", err),
        }
    }
    // EOF only after the complete payload: the half-close waited for the
    // drain.
    assert_eq!(total, PAYLOAD);

    drop(client);
    assert!(wait_until(Duration::from_secs(2), || {
        server.connection_count() == 0
    }));
    server.shut_down();
}

#[test]
fn force_close_tears_down_regardless_of_peer() {
    init_logging();
    let server = Server::start(|_| {});

    let mut client = TcpStream::connect(server.addr).expect("connect");
    let conn = server.first_connection();

    conn.force_close();

    assert!(wait_until(Duration::from_secs(2), || {
        server.connection_count() == 0
    }));
    assert!(conn.disconnected());

    // The peer observes either EOF or a reset, depending on timing.
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut buf = [0u8; 1];
    match client.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("unexpected {} bytes after force close", n),
        Err(err) => assert!(
            matches!(err.kind(), ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted),
            "unexpected error: {}",
            err
        ),
    }

    server.shut_down();
}

#[test]
fn send_on_closed_connection_is_silent_noop() {
    init_logging();
    let server = Server::start(|_| {});

    let client = TcpStream::connect(server.addr).expect("connect");
    let conn = server.first_connection();

    drop(client);
    assert!(wait_until(Duration::from_secs(2), || {
        server.connection_count() == 0
    }));
    assert!(conn.disconnected());

    // Peer state is inherently racy: sending into a closed connection is
    // not an error and must never block or revive the connection.
    conn.send(b"too late");
    conn.shutdown();
    conn.force_close();
    assert!(conn.disconnected());

    // The loop is still healthy afterwards.
    let ran = Arc::new(AtomicUsize::new(0));
    let ran_clone = ran.clone();
    server.handle.run_in_loop(move || {
        ran_clone.fetch_add(1, Ordering::SeqCst);
    });
    assert!(wait_until(Duration::from_secs(2), || {
        ran.load(Ordering::SeqCst) == 1
    }));

    server.shut_down();
}

#[test]
fn stop_read_applies_backpressure_until_start_read() {
    init_logging();
    let received = Arc::new(AtomicUsize::new(0));

    let received_clone = received.clone();
    let server = Server::start(move |conn| {
        let received = received_clone.clone();
        conn.set_message_callback(move |_, input| {
            received.fetch_add(input.readable_bytes(), Ordering::SeqCst);
            input.retrieve_all();
        });
    });

    let mut client = TcpStream::connect(server.addr).expect("connect");
    let conn = server.first_connection();

    conn.stop_read();
    assert!(wait_until(Duration::from_secs(2), || !conn.is_reading()));

    client.write_all(b"held back").expect("write");
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(
        received.load(Ordering::SeqCst),
        0,
        "read-interest disabled but data was dispatched"
    );

    conn.start_read();
    assert!(wait_until(Duration::from_secs(2), || {
        received.load(Ordering::SeqCst) == 9
    }));

    drop(client);
    assert!(wait_until(Duration::from_secs(2), || {
        server.connection_count() == 0
    }));
    server.shut_down();
}
