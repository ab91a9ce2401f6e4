//! Console sessions over a raw TCP client.

mod common;

use common::*;
use nodelink_core::wire::WELCOME;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.set_read_timeout(Some(STEP)).unwrap();
    stream
}

/// Read until `marker` shows up at the end of what was received
fn read_until(stream: &mut TcpStream, marker: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 1024];
    while !out.ends_with(marker) {
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0, "closed early after {:?}", String::from_utf8_lossy(&out));
        out.extend_from_slice(&buf[..n]);
    }
    out
}

fn read_to_close(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    stream.read_to_end(&mut out).unwrap();
    out
}

fn command(stream: &mut TcpStream, line: &str) -> String {
    stream.write_all(line.as_bytes()).unwrap();
    String::from_utf8(read_until(stream, b"\n> ")).unwrap()
}

#[test]
fn test_console_session() {
    let node = start_node();
    let mut stream = connect(node.listen_port());

    let welcome = read_until(&mut stream, WELCOME);
    assert_eq!(welcome, WELCOME);

    let help = command(&mut stream, "help\r\n");
    assert!(help.contains("connections"));
    assert!(help.contains("shutdown"));

    let threads = command(&mut stream, "threads\n");
    assert!(threads.contains("manager"), "{}", threads);
    assert!(threads.contains("console"), "{}", threads);

    let conns = command(&mut stream, "c\n");
    assert!(conns.contains("1 connection(s)"), "{}", conns);
    // "help\r\n" + "threads\n" + "c\n" have been read from this session
    assert!(conns.contains("in 16 out "), "{}", conns);
    assert!(conns.contains("Traffic per destination:"), "{}", conns);

    let unknown = command(&mut stream, "bogus\n");
    assert!(unknown.contains("Unknown command 'bogus'"));

    let blank = command(&mut stream, "\n");
    assert_eq!(blank, "\n> ");

    stream.write_all(b"quit\n").unwrap();
    let bye = read_to_close(&mut stream);
    assert!(String::from_utf8_lossy(&bye).contains("Goodbye"));

    // The session endpoint goes away with its connection
    let deadline = Instant::now() + STEP;
    while node.endpoints().iter().any(|e| e.kind == "console") {
        assert!(Instant::now() < deadline, "console endpoint still alive");
        thread::sleep(Duration::from_millis(10));
    }
    stop(node);
}

#[test]
fn test_console_kill_and_eot() {
    let node = start_node();
    let victim = spawn(&node, "victim", |ep| {
        while let Some(msg) = ep.receive(STEP * 3) {
            if msg.tag == nodelink_core::tag::KILL {
                break;
            }
        }
    });

    let mut stream = connect(node.listen_port());
    read_until(&mut stream, WELCOME);
    let out = command(&mut stream, &format!("k {}\n", victim.localid));
    assert!(out.contains("Sent KILL"));

    let deadline = Instant::now() + STEP;
    while node.endpoints().iter().any(|e| e.id == victim) {
        assert!(Instant::now() < deadline, "victim still alive");
        thread::sleep(Duration::from_millis(10));
    }

    // EOT ends the session
    stream.write_all(&[4]).unwrap();
    read_to_close(&mut stream);
    stop(node);
}

#[test]
fn test_console_disabled() {
    let node = start_with(config().console(false));
    let mut stream = connect(node.listen_port());
    read_until(&mut stream, WELCOME);
    stream.write_all(b"help\n").unwrap();
    let rest = read_to_close(&mut stream);
    assert!(rest.is_empty());
    assert!(node.endpoints().iter().all(|e| e.kind != "console"));
    stop(node);
}

#[test]
fn test_console_shutdown_command() {
    let node = start_node();
    let mut stream = connect(node.listen_port());
    read_until(&mut stream, WELCOME);
    stream.write_all(b"shutdown\n").unwrap();
    read_to_close(&mut stream);
    assert!(node.is_shutting_down());
    node.join().unwrap();
}
