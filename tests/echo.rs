//! End-to-end: listener accepts a connection, the client writes a
//! message, the server echoes it back (spec §4.3's accept/read/write
//! posting methods exercised together, as mio's own `tests/tcp.rs`
//! exercises its readiness API end-to-end).

use std::cell::RefCell;
use std::net::TcpStream;
use std::rc::Rc;
use std::time::Duration;

use reactor_engine::loop_::LoopConfig;
use reactor_engine::{HandleId, Loop};

fn run_until<F: Fn() -> bool>(loop_: &mut Loop, done: F, max_iters: usize) {
    for _ in 0..max_iters {
        if done() {
            return;
        }
        loop_.run_once().unwrap();
    }
    panic!("loop did not reach the expected state within {max_iters} iterations");
}

#[test]
fn listener_accept_then_echo_one_message() {
    let config = LoopConfig {
        max_wait: Duration::from_millis(20),
        ..LoopConfig::default()
    };
    let mut loop_ = Loop::new(config).unwrap();

    let listener = loop_.open_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
    let addr = loop_.local_addr(listener).unwrap();

    let accepted: Rc<RefCell<Option<HandleId>>> = Rc::new(RefCell::new(None));
    let accepted_cb = Rc::clone(&accepted);
    loop_
        .post_accept(
            listener,
            Box::new(move |loop_, req_id| {
                let fd = loop_.request_accept(req_id).accepted_fd;
                if let Some(fd) = fd {
                    let stream = loop_.open_accepted_stream(fd).unwrap();
                    *accepted_cb.borrow_mut() = Some(stream);
                }
            }),
        )
        .unwrap();

    // A blocking std client on another thread: the reactor loop only
    // ever touches its own thread, but std's TCP client is plain
    // blocking I/O and fine to share the OS socket with.
    let client_addr = addr.0;
    let client = std::thread::spawn(move || {
        use std::io::{Read, Write};
        // Give the loop a moment to start its accept.
        std::thread::sleep(Duration::from_millis(30));
        let mut stream = TcpStream::connect(client_addr).unwrap();
        stream.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    });

    run_until(&mut loop_, || accepted.borrow().is_some(), 200);
    let stream_handle = accepted.borrow_mut().take().unwrap();

    let echoed = Rc::new(RefCell::new(false));
    let echoed_cb = Rc::clone(&echoed);
    loop_
        .post_read(
            stream_handle,
            64,
            Box::new(move |loop_, req_id| {
                // naive re-post of whatever came in, verbatim, as the echo
                let data = loop_.request_data(req_id).to_vec();
                let echoed_cb = Rc::clone(&echoed_cb);
                loop_
                    .post_write(
                        stream_handle,
                        &data,
                        Box::new(move |_loop_, _req_id| {
                            *echoed_cb.borrow_mut() = true;
                        }),
                    )
                    .unwrap();
            }),
        )
        .unwrap();

    run_until(&mut loop_, || *echoed.borrow(), 200);
    client.join().unwrap();
}
