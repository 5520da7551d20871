//! Spec §8 scenario 2: suspend/resume. A client's own keystroke stream
//! carries escape-character commands (spec §10.F); sending the suspend
//! command must stop that client's writable interest until resume is
//! sent, after which all bytes queued in the meantime are delivered.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use consoled::config::{ConsoleConfig, ConsoleSource, ServerConfig, SyslogFacility};
use consoled::mux::Multiplexor;
use consoled::signals;

const ESCAPE: u8 = 0x05;
const PAYLOAD_LEN: usize = 6000;

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

fn try_read_some(stream: &mut TcpStream, timeout: Duration) -> Vec<u8> {
    stream.set_read_timeout(Some(timeout)).unwrap();
    let mut buf = [0u8; 4096];
    match stream.read(&mut buf) {
        Ok(0) | Err(_) => Vec::new(),
        Ok(n) => buf[..n].to_vec(),
    }
}

fn read_exact_within(stream: &mut TcpStream, want_len: usize, timeout: Duration) -> Vec<u8> {
    stream.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
    let deadline = Instant::now() + timeout;
    let mut acc = Vec::new();
    let mut buf = [0u8; 4096];
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

#[test]
fn suspended_client_receives_nothing_until_resumed() {
    let device_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let device_port = device_listener.local_addr().unwrap().port();
    let client_port = free_port();

    let console = ConsoleConfig {
        name: "console1".into(),
        source: ConsoleSource::Telnet { host: "127.0.0.1".into(), port: device_port },
        logfile: None,
        reset_cmd: None,
        buffer_bytes: 32 * 1024,
    };
    let config = ServerConfig {
        enable_keep_alive: false,
        enable_loop_back: true,
        enable_tcp_wrap: false,
        enable_zero_logs: false,
        enable_verbose: false,
        port: client_port,
        log_file_name: None,
        log_fmt_name: "%N-%Y%m%d.log".into(),
        log_file_level: logger::Severity::Info,
        syslog_facility: None::<SyslogFacility>,
        reset_cmd: None,
        t_stamp_minutes: 0,
        consoles: vec![console],
    };

    let mut mux = Multiplexor::build(config).expect("build multiplexor");
    let handle = std::thread::spawn(move || mux.run());

    device_listener.set_nonblocking(false).unwrap();
    let (mut device_stream, _) = device_listener.accept().expect("device side accept");

    let mut client = connect_retrying(client_port);
    read_until(&mut client, "console> ", Duration::from_secs(5));
    client.write_all(b"console1\r\n").unwrap();
    std::thread::sleep(Duration::from_millis(300));

    // suspend: ctrl-E 's'
    client.write_all(&[ESCAPE, b's']).unwrap();
    std::thread::sleep(Duration::from_millis(300));

    let payload: Vec<u8> = (0..PAYLOAD_LEN).map(|i| b'A' + (i % 26) as u8).collect();
    device_stream.write_all(&payload).unwrap();
    std::thread::sleep(Duration::from_millis(300));

    let got_while_suspended = try_read_some(&mut client, Duration::from_millis(300));
    assert!(got_while_suspended.is_empty(), "suspended client received {} bytes", got_while_suspended.len());

    // resume: ctrl-E 'r'
    client.write_all(&[ESCAPE, b'r']).unwrap();

    let got = read_exact_within(&mut client, PAYLOAD_LEN, Duration::from_secs(5));
    assert_eq!(got, payload);

    signals::DONE.store(true, Ordering::SeqCst);
    handle.join().unwrap().expect("multiplexor loop exited cleanly");
}
