//! Timer handle semantics (spec §4.4): repeat counting, and close-on-stop
//! when the callback returns nonzero.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use reactor_engine::loop_::LoopConfig;
use reactor_engine::Loop;

fn run_for(loop_: &mut Loop, iters: usize) {
    for _ in 0..iters {
        loop_.run_once().unwrap();
    }
}

#[test]
fn repeat_timer_fires_the_configured_number_of_times() {
    let config = LoopConfig {
        max_wait: Duration::from_millis(5),
        ..LoopConfig::default()
    };
    let mut loop_ = Loop::new(config).unwrap();

    let fires = Rc::new(RefCell::new(0u32));
    let fires_cb = Rc::clone(&fires);
    // first_gap=1ms, gap=1ms, repeat=3: the counter decrements on every
    // fire including the first, so the timer fires exactly 3 times.
    loop_
        .open_timer(
            1,
            1,
            3,
            Box::new(move |_id| {
                *fires_cb.borrow_mut() += 1;
                0
            }),
        )
        .unwrap();

    run_for(&mut loop_, 200);
    assert_eq!(*fires.borrow(), 3);
    assert_eq!(loop_.handle_count(), 1);
}

#[test]
fn returning_nonzero_stops_the_timer_even_with_repeats_left() {
    let config = LoopConfig {
        max_wait: Duration::from_millis(5),
        ..LoopConfig::default()
    };
    let mut loop_ = Loop::new(config).unwrap();

    let fires = Rc::new(RefCell::new(0u32));
    let fires_cb = Rc::clone(&fires);
    loop_
        .open_timer(
            1,
            1,
            -1, // would otherwise fire forever
            Box::new(move |_id| {
                let mut count = fires_cb.borrow_mut();
                *count += 1;
                if *count >= 2 {
                    1 // request close after the second fire
                } else {
                    0
                }
            }),
        )
        .unwrap();

    run_for(&mut loop_, 200);
    assert_eq!(*fires.borrow(), 2);

    // The timer handle was closed and destroyed; only the loop's own
    // command-channel handle remains open.
    assert_eq!(loop_.handle_count(), 1);
}

#[test]
fn one_shot_timer_runs_once_and_closes() {
    let config = LoopConfig {
        max_wait: Duration::from_millis(5),
        ..LoopConfig::default()
    };
    let mut loop_ = Loop::new(config).unwrap();

    let fires = Rc::new(RefCell::new(0u32));
    let fires_cb = Rc::clone(&fires);
    loop_
        .open_timer(
            1,
            0,
            0, // no repeat
            Box::new(move |_id| {
                *fires_cb.borrow_mut() += 1;
                0
            }),
        )
        .unwrap();

    run_for(&mut loop_, 200);
    assert_eq!(*fires.borrow(), 1);
    assert_eq!(loop_.handle_count(), 1);
}
