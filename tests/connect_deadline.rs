//! Bounded-connect behavior: absent devices fail fast, busy ports are
//! retried until the deadline runs out.

mod common;

use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use apollo_synth::{ApolloDriver, SpeechItem, SynthConfig, SynthError};
use common::{FakeDevice, FakeOpener};

fn fake_config() -> SynthConfig {
    SynthConfig {
        port: "FAKE0".into(),
        ..SynthConfig::default()
    }
}

fn wait_for(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    predicate()
}

#[test]
fn absent_device_fails_in_one_pass() {
    let device = FakeDevice::new();
    let opener = FakeOpener::new(device.clone());
    opener.availability_handle().store(false, Ordering::SeqCst);
    let attempts = opener.attempts_handle();

    let (tx, _rx) = mpsc::channel();
    let driver = ApolloDriver::with_opener(fake_config(), tx, Box::new(opener));

    let started = Instant::now();
    let err = driver
        .connect_within(Duration::from_secs(2))
        .expect_err("no device present");
    // A missing port is not worth burning the whole deadline on.
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(matches!(err, SynthError::NotDetected { .. }), "{err}");
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[test]
fn busy_port_is_retried_until_the_deadline() {
    let device = FakeDevice::new();
    let opener = FakeOpener::new(device.clone()).busy_when_unavailable();
    opener.availability_handle().store(false, Ordering::SeqCst);
    let attempts = opener.attempts_handle();

    let (tx, _rx) = mpsc::channel();
    let driver = ApolloDriver::with_opener(fake_config(), tx, Box::new(opener));

    let started = Instant::now();
    let err = driver
        .connect_within(Duration::from_millis(600))
        .expect_err("port stays busy");
    let elapsed = started.elapsed();

    assert!(matches!(err, SynthError::NotDetected { .. }), "{err}");
    assert!(
        elapsed >= Duration::from_millis(400),
        "gave up too early: {elapsed:?}"
    );
    assert!(attempts.load(Ordering::SeqCst) > 1, "no retries happened");
}

#[test]
fn busy_port_connects_once_it_frees_up() {
    let device = FakeDevice::new();
    let opener = FakeOpener::new(device.clone()).busy_when_unavailable();
    let available = opener.availability_handle();
    available.store(false, Ordering::SeqCst);

    let (tx, _rx) = mpsc::channel();
    let driver = ApolloDriver::with_opener(fake_config(), tx, Box::new(opener));

    // Free the port shortly after the bounded connect starts.
    let release = {
        let available = available.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            available.store(true, Ordering::SeqCst);
        })
    };

    driver
        .connect_within(Duration::from_secs(2))
        .expect("connects after the port frees up");
    assert!(driver.is_connected());
    release.join().unwrap();
}

#[test]
fn background_connect_attaches_when_the_device_appears() {
    let device = FakeDevice::new();
    let opener = FakeOpener::new(device.clone());
    let available = opener.availability_handle();
    available.store(false, Ordering::SeqCst);

    let (tx, _rx) = mpsc::channel();
    let driver = ApolloDriver::with_opener(fake_config(), tx, Box::new(opener));

    // Speaking while offline starts the reconnect thread.
    driver
        .speak(&[SpeechItem::Text("waiting for the port".into())])
        .unwrap();
    assert!(!driver.is_connected());

    available.store(true, Ordering::SeqCst);
    assert!(
        wait_for(Duration::from_secs(5), || driver.is_connected()),
        "reconnect thread never attached"
    );
    assert!(
        wait_for(Duration::from_secs(5), || {
            device.written_contains(b"waiting for the port")
        }),
        "queued speech was not delivered after reconnect"
    );
}
