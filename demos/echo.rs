use std::{
    io::{self, BufRead},
    thread,
    time::Duration,
};

use rdp::{Client, RdpConfig, Server};

fn main() {
    env_logger::Builder::new()
        .filter(None, log::LevelFilter::Info)
        .init();

    let cfg = RdpConfig::new()
        .retransmit_interval(Duration::from_millis(200))
        .tick_interval(Duration::from_millis(50));
    let server = Server::with_config("127.0.0.1:12345", cfg.clone()).unwrap();
    let server_addr = server.addr();

    thread::spawn(move || {
        while let Ok(conn) = server.accept() {
            log::info!("accepted {}", conn.remote_addr());
            thread::spawn(move || {
                while let Ok(msg) = conn.receive() {
                    println!("server received: {}", String::from_utf8_lossy(&msg));
                    if let Err(e) = conn.send(&msg) {
                        log::warn!("echo to {} failed: {e}", conn.remote_addr());
                        break;
                    }
                }
            });
        }
    });

    let client = Client::with_config("127.0.0.1:0", cfg).unwrap();
    let conn = client.connect(server_addr, Duration::from_secs(5)).unwrap();

    for line in io::stdin().lock().lines() {
        let input = line.unwrap();
        if input.is_empty() {
            continue;
        }
        conn.send(input.as_bytes()).unwrap();
        let echoed = conn.receive_timeout(Duration::from_secs(5)).unwrap();
        println!("echoed back: {}", String::from_utf8_lossy(&echoed));
    }

    conn.close().unwrap();
}
