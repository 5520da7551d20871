//! Spec §8 scenario 1: one console, two readers. A telnet-backed console
//! with a logfile attached is fed a single line; both an attached client
//! and the logfile should receive it byte-for-byte.
//!
//! The "remote device" side of the telnet console is simulated with a
//! plain `TcpListener` this test owns directly -- the daemon's telnet
//! opener doesn't care that the peer isn't a real piece of hardware.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use consoled::config::{ConsoleConfig, ConsoleSource, ServerConfig, SyslogFacility};
use consoled::mux::Multiplexor;
use consoled::signals;

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn read_until(stream: &mut TcpStream, needle: &str, timeout: Duration) -> String {
    stream.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
    let deadline = Instant::now() + timeout;
    let mut acc = String::new();
    let mut buf = [0u8; 256];
    while Instant::now() < deadline {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                acc.push_str(&String::from_utf8_lossy(&buf[..n]));
                if acc.contains(needle) {
                    return acc;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => panic!("unexpected read error: {e}"),
        }
    }
    panic!("timed out waiting for {needle:?}, got {acc:?}");
}

fn read_exact_within(stream: &mut TcpStream, want_len: usize, timeout: Duration) -> Vec<u8> {
    stream.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
    let deadline = Instant::now() + timeout;
    let mut acc = Vec::new();
    let mut buf = [0u8; 256];
    while acc.len() < want_len && Instant::now() < deadline {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => acc.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => panic!("unexpected read error: {e}"),
        }
    }
    acc
}

fn base_config(port: u16, console: ConsoleConfig) -> ServerConfig {
    ServerConfig {
        enable_keep_alive: false,
        enable_loop_back: true,
        enable_tcp_wrap: false,
        enable_zero_logs: false,
        enable_verbose: false,
        port,
        log_file_name: None,
        log_fmt_name: "%N-%Y%m%d.log".into(),
        log_file_level: logger::Severity::Info,
        syslog_facility: None::<SyslogFacility>,
        reset_cmd: None,
        t_stamp_minutes: 0,
        consoles: vec![console],
    }
}

#[test]
fn single_console_feeds_both_logfile_and_client() {
    let tmp = tempfile::tempdir().unwrap();
    let log_template = format!("{}/%N.log", tmp.path().display());

    let device_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let device_port = device_listener.local_addr().unwrap().port();
    let client_port = free_port();

    let console = ConsoleConfig {
        name: "console1".into(),
        source: ConsoleSource::Telnet { host: "127.0.0.1".into(), port: device_port },
        logfile: Some(log_template.clone()),
        reset_cmd: None,
        buffer_bytes: 32 * 1024,
    };
    let config = base_config(client_port, console);

    let mut mux = Multiplexor::build(config).expect("build multiplexor");
    let handle = std::thread::spawn(move || mux.run());

    // the daemon's non-blocking connect was already issued inside
    // `build()`; this accept just dequeues it.
    device_listener.set_nonblocking(false).unwrap();
    let (mut device_stream, _) = device_listener.accept().expect("device side accept");

    let mut client1 = connect_retrying(client_port);
    let mut client2 = connect_retrying(client_port);

    for client in [&mut client1, &mut client2] {
        read_until(client, "console> ", Duration::from_secs(5));
        client.write_all(b"console1\r\n").unwrap();
    }

    // give the handshake workers + loop a moment to promote both clients
    // before the payload is fed, so neither misses the fan-out.
    std::thread::sleep(Duration::from_millis(300));

    device_stream.write_all(b"HELLO\r\n").unwrap();

    for client in [&mut client1, &mut client2] {
        let got = read_exact_within(client, b"HELLO\r\n".len(), Duration::from_secs(5));
        assert_eq!(got, b"HELLO\r\n");
    }

    let log_path = consoled::opener::logfile_path(&log_template, "console1");
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut log_contents = String::new();
    while Instant::now() < deadline {
        if let Ok(mut f) = std::fs::File::open(&log_path) {
            f.read_to_string(&mut log_contents).unwrap();
            if log_contents.contains("HELLO\r\n") {
                break;
            }
            log_contents.clear();
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    assert!(log_contents.contains("HELLO\r\n"), "logfile contents: {log_contents:?}");

    signals::DONE.store(true, Ordering::SeqCst);
    handle.join().unwrap().expect("multiplexor loop exited cleanly");
}

fn connect_retrying(port: u16) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(s) => return s,
            Err(_) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(50)),
            Err(e) => panic!("could not connect to daemon: {e}"),
        }
    }
}
