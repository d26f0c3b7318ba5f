//! End-to-end HTTP exchanges against a real TCP client.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use ferrite::event_loop::EventLoop;
use ferrite::http::{self, ContentLength, StatusCode};
use ferrite::io::buffer::Buffer;

fn serve<F>(on_start: F) -> (Arc<EventLoop>, http::Server, std::net::SocketAddr, Arc<AtomicBool>)
where
    F: Fn(&http::Transaction) + Send + Sync + 'static,
{
    let event_loop = EventLoop::new(None).unwrap();
    let server = http::Server::new(None, Arc::downgrade(&event_loop));

    let ended_ok = Arc::new(AtomicBool::new(false));

    let mut config = http::ServerConfig::new("127.0.0.1:0".parse().unwrap(), on_start);
    {
        let ended_ok = ended_ok.clone();
        let event_loop = event_loop.clone();
        config.on_transaction_end = Some(Arc::new(move |_: &http::Transaction, failed: bool| {
            ended_ok.store(!failed, Ordering::SeqCst);
            event_loop.interrupt();
        }));
    }

    server.start(config).unwrap();
    let addr = server.local_addr().unwrap();
    (event_loop, server, addr, ended_ok)
}

#[test]
fn test_get_round_trip() {
    let (event_loop, _server, addr, ended_ok) = serve(|transaction| {
        assert_eq!(transaction.request_method, "GET");
        assert_eq!(transaction.request_target, "/");
        assert_eq!(transaction.request_version, "HTTP/1.1");
        assert_eq!(transaction.request_content_length, ContentLength::Length(0));
        assert_eq!(
            transaction.request_value("Host", 0).as_deref(),
            Some("localhost")
        );

        transaction.respond(StatusCode::Ok, &[], Some(Buffer::from("Hello World")));
    });

    let dispatcher = {
        let event_loop = event_loop.clone();
        thread::spawn(move || event_loop.dispatch(None).unwrap())
    };

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .unwrap();

    let mut response = String::new();
    client.read_to_string(&mut response).unwrap();
    dispatcher.join().unwrap();

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Content-Length: 11\r\n"));
    assert!(response.ends_with("\r\n\r\nHello World"));
    assert!(ended_ok.load(Ordering::SeqCst));
}

fn collect_body(transaction: &http::Transaction, accumulated: Arc<Mutex<Vec<u8>>>) {
    let sink = Buffer::with_maximum(4);
    let next = accumulated.clone();
    transaction.receive(sink, move |transaction, sink, more| {
        next.lock().unwrap().extend_from_slice(sink.as_slice());

        if more > 0 {
            collect_body(transaction, next.clone());
        } else {
            let body = next.lock().unwrap().clone();
            transaction.respond(StatusCode::Ok, &[], Some(Buffer::from(body)));
        }
    });
}

#[test]
fn test_post_streams_request_body() {
    let accumulated: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));

    let (event_loop, _server, addr, ended_ok) = {
        let accumulated = accumulated.clone();
        serve(move |transaction| {
            assert_eq!(
                transaction.request_content_length,
                ContentLength::Length(11)
            );
            collect_body(transaction, accumulated.clone());
        })
    };

    let dispatcher = {
        let event_loop = event_loop.clone();
        thread::spawn(move || event_loop.dispatch(None).unwrap())
    };

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .write_all(
            b"POST /echo HTTP/1.1\r\nHost: localhost\r\nContent-Length: 11\r\nConnection: close\r\n\r\nHello World",
        )
        .unwrap();

    let mut response = String::new();
    client.read_to_string(&mut response).unwrap();
    dispatcher.join().unwrap();

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("Hello World"));
    assert_eq!(accumulated.lock().unwrap().as_slice(), b"Hello World");
    assert!(ended_ok.load(Ordering::SeqCst));
}

#[test]
fn test_chunked_request_body() {
    let (event_loop, _server, addr, ended_ok) = serve(|transaction| {
        assert_eq!(transaction.request_content_length, ContentLength::Chunked);

        transaction.receive(Buffer::new(), |transaction, sink, more| {
            assert_eq!(more, 0);
            transaction.respond(StatusCode::Ok, &[], Some(sink));
        });
    });

    let dispatcher = {
        let event_loop = event_loop.clone();
        thread::spawn(move || event_loop.dispatch(None).unwrap())
    };

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .write_all(
            b"POST / HTTP/1.1\r\nHost: localhost\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n5\r\nHello\r\n6\r\n World\r\n0\r\n\r\n",
        )
        .unwrap();

    let mut response = String::new();
    client.read_to_string(&mut response).unwrap();
    dispatcher.join().unwrap();

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("Hello World"));
    assert!(ended_ok.load(Ordering::SeqCst));
}

#[test]
fn test_chunked_response_streaming() {
    let (event_loop, _server, addr, ended_ok) = serve(|transaction| {
        transaction.respond_streamed(StatusCode::Ok, None, &[], ContentLength::Chunked);

        transaction.send(Buffer::from("Hello "), |transaction, _sent, _more| {
            transaction.send(Buffer::from("World"), |transaction, _sent, _more| {
                // An empty chunk terminates the body.
                transaction.send(Buffer::new(), |_, _, more| {
                    assert_eq!(more, 0);
                });
            });
        });
    });

    let dispatcher = {
        let event_loop = event_loop.clone();
        thread::spawn(move || event_loop.dispatch(None).unwrap())
    };

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .unwrap();

    let mut response = String::new();
    client.read_to_string(&mut response).unwrap();
    dispatcher.join().unwrap();

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Transfer-Encoding: chunked\r\n"));
    assert!(response.contains("6\r\nHello \r\n"));
    assert!(response.contains("5\r\nWorld\r\n"));
    assert!(response.ends_with("0\r\n\r\n"));
    assert!(ended_ok.load(Ordering::SeqCst));
}

#[test]
fn test_malformed_request_yields_400() {
    let (event_loop, _server, addr, _ended_ok) = serve(|_transaction| {
        panic!("no transaction should start");
    });

    let dispatcher = {
        let event_loop = event_loop.clone();
        thread::spawn(move || event_loop.dispatch(None).unwrap())
    };

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"NOT AN HTTP REQUEST\r\n\r\n").unwrap();

    let mut response = String::new();
    client.read_to_string(&mut response).unwrap();
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));

    event_loop.interrupt();
    dispatcher.join().unwrap();
}

#[test]
fn test_path_override_selected_by_canonical_target() {
    let (event_loop, server, addr, _ended_ok) = serve(|transaction| {
        transaction.respond(StatusCode::NotFound, &[], None);
    });

    let on_end: http::EndTransactionCallback = {
        let event_loop = event_loop.clone();
        Arc::new(move |_: &http::Transaction, failed: bool| {
            assert!(!failed);
            event_loop.interrupt();
        })
    };
    server.add_path(
        "/status",
        |transaction: &http::Transaction| {
            transaction.respond(StatusCode::Ok, &[], Some(Buffer::from("up")));
        },
        Some(on_end),
    );

    let dispatcher = {
        let event_loop = event_loop.clone();
        thread::spawn(move || event_loop.dispatch(None).unwrap())
    };

    let mut client = TcpStream::connect(addr).unwrap();
    // The on-wire target canonicalizes to /status.
    client
        .write_all(b"GET /x/../status/. HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .unwrap();

    let mut response = String::new();
    client.read_to_string(&mut response).unwrap();
    dispatcher.join().unwrap();

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("up"));
}
