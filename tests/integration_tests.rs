//! End-to-end tests against a hand-rolled loopback TCP "fake nsqd", the
//! async equivalent of the teacher's `broker/integration_test_full.rs`
//! in-process server harness.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use nsq_client::client::Client;
use nsq_client::config::ClientConfig;

const RESPONSE: i32 = 0;
const ERROR: i32 = 1;
const MESSAGE: i32 = 2;

async fn start_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

async fn read_exact_vec(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}

/// Consumes MAGIC + IDENTIFY (verb line + length-prefixed JSON body) and
/// replies with a RESPONSE frame carrying `reply`.
async fn handshake(stream: &mut TcpStream, reply: &[u8]) {
    let magic = read_exact_vec(stream, 4).await;
    assert_eq!(&magic, b"  V2");

    // IDENTIFY\n
    let mut verb = Vec::new();
    loop {
        let b = read_exact_vec(stream, 1).await;
        verb.push(b[0]);
        if b[0] == b'\n' {
            break;
        }
    }
    assert_eq!(&verb, b"IDENTIFY\n");

    let len_bytes = read_exact_vec(stream, 4).await;
    let len = i32::from_be_bytes(len_bytes.try_into().unwrap()) as usize;
    let _body = read_exact_vec(stream, len).await;

    write_frame(stream, RESPONSE, reply).await;
}

async fn write_frame(stream: &mut TcpStream, frame_type: i32, payload: &[u8]) {
    let mut out = Vec::new();
    out.extend_from_slice(&((payload.len() as i32) + 4).to_be_bytes());
    out.extend_from_slice(&frame_type.to_be_bytes());
    out.extend_from_slice(payload);
    stream.write_all(&out).await.unwrap();
}

async fn read_line(stream: &mut TcpStream) -> String {
    let mut line = Vec::new();
    loop {
        let b = read_exact_vec(stream, 1).await;
        if b[0] == b'\n' {
            break;
        }
        line.push(b[0]);
    }
    String::from_utf8(line).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_completes_identify_handshake() {
    let (listener, port) = start_listener().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        handshake(&mut stream, b"OK").await;
        stream
    });

    let client = Client::new(ClientConfig::default(), Vec::new(), None);
    let conn = client.add("127.0.0.1", port).await.unwrap().unwrap();
    assert!(conn.lock().await.is_ready());
    server.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn heartbeat_triggers_nop_reply() {
    let (listener, port) = start_listener().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        handshake(&mut stream, b"OK").await;
        write_frame(&mut stream, RESPONSE, b"_heartbeat_").await;
        let line = read_line(&mut stream).await;
        assert_eq!(line, "NOP");
    });

    let client = Client::new(ClientConfig::default(), Vec::new(), None);
    let _conn = client.add("127.0.0.1", port).await.unwrap().unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let frames = client.read_once().await;
        if frames.is_empty() && tokio::time::Instant::now() < deadline {
            continue;
        }
        break;
    }
    server.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn fatal_error_closes_connection_non_fatal_keeps_it_alive() {
    let (listener, port) = start_listener().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        handshake(&mut stream, b"OK").await;
        write_frame(&mut stream, ERROR, b"E_FIN_FAILED oops").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        write_frame(&mut stream, ERROR, b"E_INVALID fatal").await;
    });

    let client = Client::new(ClientConfig::default(), Vec::new(), None);
    let key = ("127.0.0.1".to_string(), port);
    client.add(&key.0, key.1).await.unwrap().unwrap();

    // First pass: non-fatal error surfaces, connection stays.
    let mut surfaced_non_fatal = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        let frames = client.read_once().await;
        if !frames.is_empty() {
            surfaced_non_fatal = true;
            break;
        }
    }
    assert!(surfaced_non_fatal);
    assert!(client.get(&key).await.is_some());

    // Second pass: fatal error surfaces then closes the connection.
    let mut saw_fatal_close = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        client.read_once().await;
        if client.get(&key).await.is_none() {
            saw_fatal_close = true;
            break;
        }
    }
    assert!(saw_fatal_close);
    server.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn message_frame_is_surfaced_and_decrements_ready() {
    let (listener, port) = start_listener().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        handshake(&mut stream, b"OK").await;
        let rdy_line = read_line(&mut stream).await;
        assert_eq!(rdy_line, "RDY 1");

        let mut payload = Vec::new();
        payload.extend_from_slice(&7i64.to_be_bytes());
        payload.extend_from_slice(&1u16.to_be_bytes());
        payload.extend_from_slice(b"0123456789abcdef");
        payload.extend_from_slice(b"hello");
        write_frame(&mut stream, MESSAGE, &payload).await;

        let line = read_line(&mut stream).await;
        assert_eq!(line, "FIN 0123456789abcdef");
    });

    let client = Client::new(ClientConfig::default(), Vec::new(), None);
    let conn = client.add("127.0.0.1", port).await.unwrap().unwrap();
    conn.lock().await.rdy(1);
    conn.lock().await.flush().await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let mut got_message = false;
    while tokio::time::Instant::now() < deadline {
        let frames = client.read_once().await;
        for sf in frames {
            if let nsq_client::Frame::Message(msg) = sf.frame {
                assert_eq!(&msg.body[..], b"hello");
                got_message = true;
                let mut c = conn.lock().await;
                c.fin(&msg.id_str());
                c.flush().await.unwrap();
            }
        }
        if got_message {
            break;
        }
    }
    assert!(got_message);
    assert_eq!(conn.lock().await.current_ready(), 0);
    server.await.unwrap();
}
