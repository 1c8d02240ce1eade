use std::time::Duration;

use rdp::{Client, Server};

fn main() {
    // Start the server
    let server = Server::new("127.0.0.1:12345").unwrap();

    // Start the client and connect
    let client = Client::new("127.0.0.1:0").unwrap();
    let conn = client
        .connect(server.addr(), Duration::from_secs(5))
        .unwrap();

    let server_thread = std::thread::spawn(move || {
        let conn = server.accept().unwrap();
        let msg = conn.receive().unwrap();
        println!("{}", std::str::from_utf8(&msg).unwrap());
    });

    conn.send(b"Hello World!").unwrap();
    server_thread.join().unwrap();
}
