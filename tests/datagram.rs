//! Unconnected datagram read/write (spec §4.3 "Datagram"): the peer
//! address travels with every operation rather than being fixed at
//! `connect` time.

use std::cell::RefCell;
use std::net::UdpSocket;
use std::rc::Rc;
use std::time::Duration;

use reactor_engine::loop_::LoopConfig;
use reactor_engine::Loop;

#[test]
fn read_from_reports_the_senders_address() {
    let config = LoopConfig {
        max_wait: Duration::from_millis(20),
        ..LoopConfig::default()
    };
    let mut loop_ = Loop::new(config).unwrap();

    let datagram = loop_.open_datagram("127.0.0.1:0".parse().unwrap()).unwrap();
    let server_addr = loop_.local_addr(datagram).unwrap().0;

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    let sender_addr = sender.local_addr().unwrap();
    sender.send_to(b"hello", server_addr).unwrap();

    let received: Rc<RefCell<Option<(Vec<u8>, std::net::SocketAddr)>>> = Rc::new(RefCell::new(None));
    let received_cb = Rc::clone(&received);
    loop_
        .post_read_from(
            datagram,
            64,
            Box::new(move |loop_, req_id| {
                let data = loop_.request_data(req_id).to_vec();
                let from = loop_.request_accept(req_id).remote.unwrap();
                *received_cb.borrow_mut() = Some((data, from));
            }),
        )
        .unwrap();

    for _ in 0..100 {
        if received.borrow().is_some() {
            break;
        }
        loop_.run_once().unwrap();
    }

    let (data, from) = received.borrow_mut().take().expect("datagram never arrived");
    assert_eq!(data, b"hello");
    assert_eq!(from, sender_addr);
}
