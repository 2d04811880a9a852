mod common;

use common::{init_logging, spawn_loop, wait_until};
use netloop::Acceptor;
use netloop::net::socket;

use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type AcceptorSlot = Arc<Mutex<Option<Arc<Acceptor>>>>;

fn bind_acceptor(
    slot: &AcceptorSlot,
    accepted: Arc<Mutex<Vec<SocketAddr>>>,
    close_accepted: bool,
) -> (netloop::LoopHandle, std::thread::JoinHandle<()>, SocketAddr) {
    let listen_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let bound = Arc::new(Mutex::new(None));

    let slot_clone = slot.clone();
    let bound_clone = bound.clone();
    let (handle, join) = spawn_loop(move |event_loop| {
        let acceptor = Acceptor::new(event_loop.handle(), &listen_addr);
        if close_accepted {
            let accepted = accepted.clone();
            acceptor.set_new_connection_callback(move |connection_fd, peer_addr| {
                accepted.lock().unwrap().push(peer_addr);
                socket::close(connection_fd);
            });
        }
        acceptor.listen();
        assert!(acceptor.listening());
        *bound_clone.lock().unwrap() = Some(acceptor.listen_addr().expect("listen addr"));
        *slot_clone.lock().unwrap() = Some(acceptor);
    });

    assert!(wait_until(Duration::from_secs(2), || {
        bound.lock().unwrap().is_some()
    }));
    let addr = bound.lock().unwrap().unwrap();
    (handle, join, addr)
}

fn shut_down(slot: AcceptorSlot, handle: netloop::LoopHandle, join: std::thread::JoinHandle<()>) {
    let handle_clone = handle.clone();
    handle.queue_in_loop(move || {
        // The acceptor deregisters its channel in drop, which must happen
        // on the owning thread.
        slot.lock().unwrap().take();
        handle_clone.quit();
    });
    join.join().expect("loop thread panicked");
}

#[test]
fn accept_fires_callback_once_with_peer_address() {
    init_logging();
    let slot: AcceptorSlot = Arc::new(Mutex::new(None));
    let accepted = Arc::new(Mutex::new(Vec::new()));
    let (handle, join, addr) = bind_acceptor(&slot, accepted.clone(), true);

    let client = TcpStream::connect(addr).expect("connect");
    let client_addr = client.local_addr().expect("client local addr");

    assert!(wait_until(Duration::from_secs(2), || {
        accepted.lock().unwrap().len() == 1
    }));
    assert_eq!(accepted.lock().unwrap()[0], client_addr);

    // Exactly once: no further callback for the same connection.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(accepted.lock().unwrap().len(), 1);

    drop(client);
    shut_down(slot, handle, join);
}

#[test]
fn accepts_multiple_connections() {
    init_logging();
    let slot: AcceptorSlot = Arc::new(Mutex::new(None));
    let accepted = Arc::new(Mutex::new(Vec::new()));
    let (handle, join, addr) = bind_acceptor(&slot, accepted.clone(), true);

    let clients: Vec<_> = (0..5)
        .map(|_| TcpStream::connect(addr).expect("connect"))
        .collect();

    assert!(wait_until(Duration::from_secs(2), || {
        accepted.lock().unwrap().len() == 5
    }));

    drop(clients);
    shut_down(slot, handle, join);
}

#[test]
fn accepted_descriptor_without_callback_is_closed() {
    init_logging();
    let slot: AcceptorSlot = Arc::new(Mutex::new(None));
    let accepted = Arc::new(Mutex::new(Vec::new()));
    let (handle, join, addr) = bind_acceptor(&slot, accepted, false);

    let mut client = TcpStream::connect(addr).expect("connect");
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();

    // With no new-connection callback installed the acceptor closes the
    // descriptor immediately, so the client observes EOF.
    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).expect("read");
    assert_eq!(n, 0);

    shut_down(slot, handle, join);
}
