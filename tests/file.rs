//! Positional file I/O through the `io_uring` submission ring (spec
//! §4.5): `post_file_write`/`post_file_read` bypass the per-handle
//! read/write queues entirely, completing only once the kernel reports
//! back via the ring rather than through epoll readiness.

#![cfg(target_os = "linux")]

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use reactor_engine::loop_::LoopConfig;
use reactor_engine::Loop;

#[test]
fn write_then_read_back_round_trips() {
    let config = LoopConfig {
        max_wait: Duration::from_millis(20),
        ..LoopConfig::default()
    };
    let mut loop_ = Loop::new(config).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("uring-roundtrip.bin");
    let file = loop_.open_file(path.to_str().unwrap(), true).unwrap();

    let wrote = Rc::new(RefCell::new(false));
    let wrote_cb = Rc::clone(&wrote);
    loop_
        .post_file_write(
            file,
            0,
            b"hello, file",
            Box::new(move |_loop_, _req_id| {
                *wrote_cb.borrow_mut() = true;
            }),
        )
        .unwrap();

    for _ in 0..200 {
        if *wrote.borrow() {
            break;
        }
        loop_.run_once().unwrap();
    }
    assert!(*wrote.borrow(), "file write never completed");

    let read: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));
    let read_cb = Rc::clone(&read);
    loop_
        .post_file_read(
            file,
            64,
            0,
            Box::new(move |loop_, req_id| {
                *read_cb.borrow_mut() = Some(loop_.request_data(req_id).to_vec());
            }),
        )
        .unwrap();

    for _ in 0..200 {
        if read.borrow().is_some() {
            break;
        }
        loop_.run_once().unwrap();
    }

    let data = read.borrow_mut().take().expect("file read never completed");
    assert_eq!(data, b"hello, file");
}

#[test]
fn write_larger_than_ring_can_submit_in_one_shot_still_completes() {
    let config = LoopConfig {
        max_wait: Duration::from_millis(20),
        ..LoopConfig::default()
    };
    let mut loop_ = Loop::new(config).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("uring-large.bin");
    let file = loop_.open_file(path.to_str().unwrap(), true).unwrap();

    let payload = vec![0x5au8; 256 * 1024];
    let done = Rc::new(RefCell::new(false));
    let done_cb = Rc::clone(&done);
    loop_
        .post_file_write(
            file,
            0,
            &payload,
            Box::new(move |_loop_, _req_id| {
                *done_cb.borrow_mut() = true;
            }),
        )
        .unwrap();

    for _ in 0..1000 {
        if *done.borrow() {
            break;
        }
        loop_.run_once().unwrap();
    }
    assert!(*done.borrow(), "large file write never completed");
    assert_eq!(std::fs::read(&path).unwrap().len(), payload.len());
}
