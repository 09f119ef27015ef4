//! End-to-end tests driving the real lookup helper binary.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::{sleep, timeout, Instant};

use mudnet::lookup::channel::{
    Config, LookupChannel, SlaveState, SubmitOutcome,
};
use mudnet::lookup::wire::LookupResponse;
use mudnet::lookup::Handle;

fn helper_channel() -> LookupChannel {
    let mut config = Config::new();
    config.set_slave_path(env!("CARGO_BIN_EXE_lookup-slave").into());
    config.set_want_dns(true);
    LookupChannel::new(config)
}

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

/// Waits for the next response on the channel, draining past spurious
/// wakeups and dropped duplicates.
async fn next_response(chan: &mut LookupChannel) -> LookupResponse {
    timeout(Duration::from_secs(20), async {
        loop {
            chan.readable().await;
            if let Some(response) = chan.drain_ready() {
                return response;
            }
        }
    })
    .await
    .expect("no response within the deadline")
}

#[tokio::test]
async fn loopback_lookup_round_trip() {
    let mut chan = helper_channel();

    let outcome = chan.submit(
        Handle(1),
        addr("127.0.0.1:4201"),
        addr("127.0.0.1:50000"),
        Instant::now(),
    );
    assert_eq!(outcome, SubmitOutcome::Queued);
    assert_eq!(chan.state(), SlaveState::Pending);

    let response = next_response(&mut chan).await;
    assert_eq!(response.handle, Handle(1));
    assert_eq!(response.ipaddr, "127.0.0.1");
    assert_eq!(response.local_port, 4201);
    // Either the loopback address reverse-resolves, or the hostname
    // falls back to the numeric address. Blank is a contract violation.
    assert!(!response.hostname.is_empty());

    assert_eq!(chan.state(), SlaveState::Ready);
    assert_eq!(chan.num_pending(), 0);

    chan.shutdown().await;
    assert_eq!(chan.state(), SlaveState::Down);
}

#[tokio::test]
async fn helper_death_mid_request_yields_exactly_one_response() {
    let mut chan = helper_channel();

    chan.submit(
        Handle(7),
        addr("127.0.0.1:4201"),
        addr("127.0.0.1:50001"),
        Instant::now(),
    );
    let pid = chan.slave_pid().expect("helper is running");

    // Kill the helper out from under the pending request.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
    let gone = timeout(Duration::from_secs(10), async {
        loop {
            chan.handle_child_exit();
            if chan.state() == SlaveState::Down {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(gone.is_ok(), "helper exit never detected");
    assert_eq!(chan.num_pending(), 1);

    // Driving the channel again respawns the helper and replays the
    // lost request.
    let degraded = chan.resubmit_stale(Instant::now());
    assert!(degraded.is_empty());
    assert_eq!(chan.state(), SlaveState::Pending);

    let response = next_response(&mut chan).await;
    assert_eq!(response.handle, Handle(7));
    assert_eq!(chan.num_pending(), 0);

    // And only one response surfaces for that handle: anything further
    // on the channel is dropped as a duplicate.
    sleep(Duration::from_millis(200)).await;
    assert!(chan.drain_ready().is_none());

    chan.shutdown().await;
}
