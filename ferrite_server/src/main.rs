//! Minimal HTTP + WebSocket echo server. Plain requests get a greeting;
//! WebSocket upgrades are accepted on any offered subprotocol and every
//! message is echoed back until the peer closes.

use std::sync::Arc;
use std::time::Duration;

use ferrite::event_loop::EventLoop;
use ferrite::http;
use ferrite::io::buffer::Buffer;
use ferrite::logging::{self, error, info};
use ferrite::ws;

fn main() {
    let log = logging::init("ferrite_server");

    let binding = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8080".to_string());
    let binding = match binding.parse() {
        Ok(binding) => binding,
        Err(_) => {
            error!(log, "invalid binding"; "binding" => binding);
            std::process::exit(1);
        }
    };

    let event_loop = EventLoop::new(&log).expect("event loop");

    let ws_server = Arc::new(ws::Server::new(&log, Arc::downgrade(&event_loop)));
    ws_server.start();

    let http_server = http::Server::new(&log, Arc::downgrade(&event_loop));

    let mut config = http::ServerConfig::new(binding, |transaction: &http::Transaction| {
        match ws::is_upgrade(transaction) {
            Some(protocols) => ws::upgrade(transaction, &protocols[0]),
            None => transaction.respond(
                http::StatusCode::Ok,
                &[http::HeaderField::new("Content-Type", "text/plain")],
                Some(Buffer::from("Hello World")),
            ),
        }
    });

    {
        let ws_server = ws_server.clone();
        let log = log.clone();
        config.on_transaction_end = Some(Arc::new(
            move |transaction: &http::Transaction, failed: bool| {
                if failed {
                    return;
                }

                // Only upgraded transactions hand over their connection.
                let upgrade = match transaction.upgraded() {
                    Ok(upgrade) => upgrade,
                    Err(_) => return,
                };

                let socket = match ws_server.add(upgrade) {
                    Ok(socket) => socket,
                    Err(err) => {
                        error!(log, "socket rejected"; "error" => %err);
                        return;
                    }
                };

                socket.set_no_delay(true);
                socket.set_ping_interval(Some(Duration::from_secs(30)));
                socket.set_message_callback(|socket, message| {
                    socket.send(message);
                });

                let log = log.clone();
                socket.set_close_callback(move |socket, clean, code, _reason| {
                    info!(log, "socket closed";
                          "socket" => socket.id,
                          "clean" => clean,
                          "code" => code);
                });
            },
        ));
    }

    if let Err(err) = http_server.start(config) {
        error!(log, "startup failed"; "error" => %err);
        std::process::exit(1);
    }

    info!(log, "serving"; "binding" => %binding);

    loop {
        if let Err(err) = event_loop.dispatch(None) {
            error!(log, "dispatch failed"; "error" => %err);
            std::process::exit(1);
        }
    }
}
