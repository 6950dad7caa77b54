//! End-to-end runs against stub servers on the loopback.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dnsload::config::{Config, Family};
use dnsload::run::{Driver, ExitReason};
use dnsload::template::Template;

//------------ Stub Server ---------------------------------------------------

/// What the stub does with each query it reads.
#[derive(Clone, Copy, Debug)]
enum Stub {
    /// Echo the query back with the QR bit set.
    Echo,
    /// Echo with the QR bit set and this response code.
    Rcode(u8),
    /// Echo with the QR bit set but the ID flipped.
    WrongId,
    /// Read the query, never answer.
    Silent,
}

/// Spawns a stub server and returns its address.
fn spawn_stub(stub: Stub) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for conn in listener.incoming() {
            let Ok(mut conn) = conn else { break };
            thread::spawn(move || {
                let _ = serve_one(&mut conn, stub);
            });
        }
    });
    addr
}

/// Handles a single connection: one query, at most one response.
fn serve_one(conn: &mut TcpStream, stub: Stub) -> std::io::Result<()> {
    let mut prefix = [0u8; 2];
    conn.read_exact(&mut prefix)?;
    let len = u16::from_be_bytes(prefix) as usize;
    let mut msg = vec![0u8; len];
    conn.read_exact(&mut msg)?;
    match stub {
        Stub::Silent => {
            // Hold the connection open until the client gives up.
            thread::sleep(Duration::from_secs(2));
            return Ok(());
        }
        Stub::Echo => {
            msg[2] |= 0x80;
        }
        Stub::Rcode(rcode) => {
            msg[2] |= 0x80;
            msg[3] = (msg[3] & 0xf0) | rcode;
        }
        Stub::WrongId => {
            msg[0] ^= 0xff;
            msg[2] |= 0x80;
        }
    }
    // One write so the client's single recv sees the whole response.
    let mut response = Vec::with_capacity(2 + msg.len());
    response.extend_from_slice(&prefix);
    response.extend_from_slice(&msg);
    conn.write_all(&response)?;
    Ok(())
}

//------------ Helpers -------------------------------------------------------

/// A quick configuration for loopback runs.
fn quick_config(server: SocketAddr, num_req: u64) -> Config {
    let mut cfg = Config::new(server);
    cfg.rate = 2000;
    cfg.aggressivity = 50;
    cfg.capacity = 2000;
    cfg.num_req = Some(num_req);
    cfg.drop_time = Duration::from_secs(5);
    cfg.seed = Some(1);
    cfg
}

fn run_driver(cfg: Config) -> Driver {
    let template = Template::build(Family::V4, false, false);
    let mut driver = Driver::new(
        cfg,
        template,
        Arc::new(AtomicBool::new(false)),
    )
    .unwrap();
    let reason = driver.run().unwrap();
    assert_ne!(reason, ExitReason::Fatal);
    driver
}

//------------ Scenarios -----------------------------------------------------

#[test]
fn echo_server_answers_everything() {
    let addr = spawn_stub(Stub::Echo);
    let driver = run_driver(quick_config(addr, 40));
    let stats = driver.stats();
    assert_eq!(stats.sends_ok, 40);
    assert_eq!(stats.receives_ok, 40);
    assert_eq!(stats.rcodes[0], 40);
    assert_eq!(stats.id_mismatch, 0);
    assert_eq!(stats.sent_timeouts, 0);
    assert_eq!(driver.pool().in_flight(), 0);
}

#[test]
fn exchange_accounting_balances() {
    let addr = spawn_stub(Stub::Echo);
    let driver = run_driver(quick_config(addr, 25));
    let stats = driver.stats();
    // Once the pool has drained, every started connect is accounted for.
    assert_eq!(
        stats.connects_started,
        stats.sends_ok
            + stats.bad_send
            + stats.conn_timeouts
            + stats.bad_connect
    );
    assert!(stats.receives_ok <= stats.sends_ok);
}

#[test]
fn nxdomain_server_fills_the_rcode_bucket() {
    let addr = spawn_stub(Stub::Rcode(3));
    let driver = run_driver(quick_config(addr, 20));
    let stats = driver.stats();
    assert_eq!(stats.receives_ok, 20);
    assert_eq!(stats.rcodes[3], stats.receives_ok);
    assert_eq!(stats.rcodes[0], 0);
}

#[test]
fn unknown_rcodes_land_in_the_last_bucket() {
    let addr = spawn_stub(Stub::Rcode(11));
    let driver = run_driver(quick_config(addr, 10));
    let stats = driver.stats();
    assert_eq!(stats.receives_ok, 10);
    assert_eq!(stats.rcodes[6], 10);
}

#[test]
fn wrong_ids_are_rejected() {
    let addr = spawn_stub(Stub::WrongId);
    let driver = run_driver(quick_config(addr, 20));
    let stats = driver.stats();
    assert_eq!(stats.receives_ok, 0);
    assert_eq!(stats.id_mismatch, 20);
    assert_eq!(driver.pool().in_flight(), 0);
}

#[test]
fn silent_server_times_every_query_out() {
    let addr = spawn_stub(Stub::Silent);
    let mut cfg = quick_config(addr, 10);
    cfg.drop_time = Duration::from_millis(100);
    let driver = run_driver(cfg);
    let stats = driver.stats();
    assert_eq!(stats.receives_ok, 0);
    assert_eq!(stats.sent_timeouts, stats.sends_ok);
    assert_eq!(stats.sends_ok, 10);
    assert_eq!(driver.pool().in_flight(), 0);
}

#[test]
fn tiny_pool_reports_local_limits() {
    let addr = spawn_stub(Stub::Silent);
    let mut cfg = Config::new(addr);
    cfg.rate = 5000;
    cfg.aggressivity = 50;
    cfg.capacity = 2;
    cfg.drop_time = Duration::from_secs(10);
    cfg.period = Some(Duration::from_millis(300));
    cfg.seed = Some(1);
    let template = Template::build(Family::V4, false, false);
    let mut driver = Driver::new(
        cfg,
        template,
        Arc::new(AtomicBool::new(false)),
    )
    .unwrap();
    let reason = driver.run().unwrap();
    assert_eq!(reason, ExitReason::PeriodElapsed);
    let stats = driver.stats();
    assert!(stats.local_limit > 0);
    assert!(driver.pool().used() <= 2);
    assert!(driver.pool().in_flight() <= 2);
}

#[test]
fn pacing_bounds_the_connect_rate() {
    let addr = spawn_stub(Stub::Echo);
    let mut cfg = Config::new(addr);
    cfg.rate = 200;
    cfg.aggressivity = 1;
    cfg.capacity = 2000;
    cfg.period = Some(Duration::from_secs(1));
    cfg.seed = Some(1);
    let template = Template::build(Family::V4, false, false);
    let mut driver = Driver::new(
        cfg,
        template,
        Arc::new(AtomicBool::new(false)),
    )
    .unwrap();
    let reason = driver.run().unwrap();
    assert_eq!(reason, ExitReason::PeriodElapsed);
    let connects = driver.stats().connects_started;
    // With aggressivity 1 the pacer cannot initiate more than one
    // connect per interval; the lower bound is loose to survive slow
    // test machines.
    assert!(connects <= 210, "connects: {}", connects);
    assert!(connects >= 50, "connects: {}", connects);
}

#[test]
fn interrupt_stops_the_run() {
    let addr = spawn_stub(Stub::Echo);
    let mut cfg = Config::new(addr);
    cfg.rate = 100;
    cfg.capacity = 2000;
    cfg.seed = Some(1);
    let template = Template::build(Family::V4, false, false);
    let interrupted = Arc::new(AtomicBool::new(true));
    let mut driver =
        Driver::new(cfg, template, interrupted.clone()).unwrap();
    let reason = driver.run().unwrap();
    assert_eq!(reason, ExitReason::Interrupted);
}

#[test]
fn max_drop_aborts_the_run() {
    let addr = spawn_stub(Stub::Silent);
    let mut cfg = Config::new(addr);
    cfg.rate = 2000;
    cfg.aggressivity = 50;
    cfg.capacity = 2000;
    cfg.drop_time = Duration::from_secs(30);
    cfg.max_drop = Some(dnsload::config::DropLimit::Count(5));
    cfg.period = Some(Duration::from_secs(20));
    cfg.seed = Some(1);
    let template = Template::build(Family::V4, false, false);
    let mut driver = Driver::new(
        cfg,
        template,
        Arc::new(AtomicBool::new(false)),
    )
    .unwrap();
    let reason = driver.run().unwrap();
    assert_eq!(reason, ExitReason::MaxDropReached);
    assert!(driver.stats().drops() > 5);
}
