//! Fetching from a local HTTP responder through libcurl and the tokio reactor.
#![cfg(feature = "curl")]

use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;

use evfetch::config::{ByteSize, Config};
use evfetch::fetch::{self, FetchOptions};
use tempfile::TempDir;

/// Answer `connections` requests with `body`, then stop
fn serve(body: &'static [u8], connections: usize) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    thread::spawn(move || {
        for stream in listener.incoming().take(connections) {
            let mut stream = stream.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            stream.write_all(head.as_bytes()).unwrap();
            stream.write_all(body).unwrap();
        }
    });

    format!("http://{}/data.bin", addr)
}

fn options(output_dir: Option<&TempDir>, max_body: u64) -> FetchOptions {
    FetchOptions {
        output_dir: output_dir.map(|dir| dir.path().to_path_buf()),
        max_body: ByteSize(max_body),
    }
}

#[tokio::test]
async fn fetches_concurrently_into_files() {
    let first = serve(b"first body", 1);
    let second = serve(b"the second body", 1);
    let output = TempDir::new().unwrap();

    let reports = fetch::run(
        &[first.clone(), second.clone()],
        &Config::default(),
        &options(Some(&output), 1024),
    )
    .await
    .unwrap();

    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].url, first);
    assert_eq!(reports[0].status, Some(200));
    assert_eq!(reports[0].bytes, 10);
    assert!(reports[0].is_success());
    assert_eq!(reports[1].bytes, 15);

    let saved = std::fs::read(output.path().join("000-data.bin")).unwrap();
    assert_eq!(saved, b"first body");
    let saved = std::fs::read(output.path().join("001-data.bin")).unwrap();
    assert_eq!(saved, b"the second body");
}

#[tokio::test]
async fn oversized_body_is_aborted() {
    let url = serve(&[b'x'; 4096], 1);

    let reports = fetch::run(&[url], &Config::default(), &options(None, 100))
        .await
        .unwrap();

    assert_eq!(reports.len(), 1);
    assert!(!reports[0].is_success());
    assert_eq!(reports[0].error.as_deref(), Some("body exceeds limit of 100B"));
    assert!(reports[0].bytes <= 100);
}

#[tokio::test]
async fn refused_connection_reported_per_url() {
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        format!("http://{}/", listener.local_addr().unwrap())
    };
    let open = serve(b"ok", 1);

    let reports = fetch::run(&[closed, open], &Config::default(), &options(None, 1024))
        .await
        .unwrap();

    assert!(!reports[0].is_success());
    assert!(reports[0].error.is_some());
    assert!(reports[1].is_success());
    assert_eq!(reports[1].bytes, 2);
}
