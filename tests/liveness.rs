//! Liveness in both directions: the driver reclaims resources of clients
//! that stop heartbeating, and clients detect a dead driver.

use std::time::{Duration, Instant};

use conduit::client::{Client, ClientContext};
use conduit::driver::{DriverConfig, MediaDriver};
use conduit::Error;
use tempfile::tempdir;

#[test]
fn driver_reclaims_silent_client() {
    let dir = tempdir().expect("tempdir");
    let config = DriverConfig {
        term_length: 64 * 1024,
        client_ttl: Duration::from_millis(300),
        linger: Duration::from_millis(100),
        ..DriverConfig::with_dir(dir.path())
    };
    let _driver = MediaDriver::launch(config).expect("driver");

    // A client whose keepalive cadence is far slower than the driver's TTL
    // looks dead to the driver almost immediately.
    let context = ClientContext {
        keepalive_interval: Duration::from_secs(60),
        ..ClientContext::with_dir(dir.path())
    };
    let client = Client::connect(context).expect("client");
    let _subscription = client.add_subscription("ipc:leaky", 4).expect("subscription");
    let mut publication = client.add_publication("ipc:leaky", 4).expect("publication");
    assert!(publication.is_connected());

    // The driver times the client out and tears both registrations down:
    // the stream closes under the publication.
    let deadline = Instant::now() + Duration::from_secs(10);
    while !publication.is_closed() {
        assert!(Instant::now() < deadline, "silent client never reclaimed");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn client_detects_dead_driver() {
    let dir = tempdir().expect("tempdir");
    let driver = MediaDriver::launch(DriverConfig::with_dir(dir.path())).expect("driver");

    let context = ClientContext {
        driver_timeout: Duration::from_millis(300),
        ..ClientContext::with_dir(dir.path())
    };
    let client = Client::connect(context).expect("client");
    assert!(client.driver_active());

    driver.shutdown();

    let deadline = Instant::now() + Duration::from_secs(10);
    while client.driver_active() {
        assert!(Instant::now() < deadline, "driver death never detected");
        std::thread::sleep(Duration::from_millis(20));
    }
    // Commands now fail fast instead of hanging.
    let err = client
        .add_publication("ipc:orphan", 1)
        .err()
        .expect("command against dead driver must fail");
    assert!(matches!(err, Error::DriverInactive | Error::Timeout));
}

#[test]
fn connect_without_driver_fails() {
    let dir = tempdir().expect("tempdir");
    assert!(Client::connect(ClientContext::with_dir(dir.path())).is_err());
}
