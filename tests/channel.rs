//! The command-channel wire format over a real connected socket pair
//! (spec §4.7), complementing the in-memory `Reassembler` unit tests in
//! `src/channel.rs`.

use reactor_engine::channel::{self, Frame, FrameKind, Reassembler};
use reactor_engine::socket::SocketPair;

#[test]
fn frame_sent_over_a_socket_pair_is_reassembled_on_the_other_end() {
    let pair = SocketPair::new().unwrap();
    let frame = Frame::new(FrameKind::Heartbeat, 7, vec![1, 2, 3, 4]);
    channel::send_frame(&mut &pair.a, &frame).unwrap();

    let mut asm = Reassembler::new();
    // Give the kernel a moment to make the bytes available; loopback
    // AF_UNIX delivery is effectively synchronous but not guaranteed.
    let mut got = None;
    for _ in 0..50 {
        let n = channel::read_into(&mut &pair.b, &mut asm).unwrap_or(0);
        if n > 0 {
            got = asm.pop_frame().unwrap();
            if got.is_some() {
                break;
            }
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
    }

    let got = got.expect("frame never arrived");
    assert_eq!(got.kind, FrameKind::Heartbeat);
    assert_eq!(got.sn, 7);
    assert_eq!(got.payload, vec![1, 2, 3, 4]);
}

#[test]
fn exit_and_exit_resp_round_trip_the_response_bit() {
    let request = Frame::new(FrameKind::Exit, 1, Vec::new());
    let response = Frame::new(FrameKind::ExitResp, 1, Vec::new());
    assert!(!request.kind.is_response());
    assert!(response.kind.is_response());
    assert_eq!(request.sn, response.sn);
}
