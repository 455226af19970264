use std::net::SocketAddr;

use minishard::future::when_all;
use minishard::net::{self, ListenOptions};
use minishard::{Buf, Config, ShardRuntime};

// TCP echo on one shard: the server reads exactly 5 bytes and writes
// them back; both sides observe EOF after close.
#[test]
fn echo_on_one_shard() {
    let cfg = Config {
        smp: Some(1),
        handle_sigint: false,
        ..Config::default()
    };
    let rt = ShardRuntime::new(&cfg).expect("runtime setup");
    let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();

    let code = rt.run(move || {
        let server = net::listen(addr, ListenOptions::default()).expect("listen");

        let server_side = server.accept().and_then(|(sock, _peer)| {
            let input = sock.input();
            let output = sock.output();
            input.read_exactly(5).and_then(move |payload| {
                assert_eq!(payload.as_slice(), b"hello");
                let flush_out = output.clone();
                let close_out = output.clone();
                output
                    .write(payload.as_slice())
                    .and_then(move |_| flush_out.flush())
                    .and_then(move |_| close_out.close())
                    .and_then(move |_| {
                        input
                            .read()
                            .then(|buf| assert!(buf.is_empty(), "server sees EOF"))
                    })
            })
        });

        let client_side = net::connect(addr).and_then(|sock| {
            let input = sock.input();
            let output = sock.output();
            let flush_out = output.clone();
            let close_out = output.clone();
            output
                .write(b"hello")
                .and_then(move |_| flush_out.flush())
                .and_then(move |_| close_out.close())
                .and_then(move |_| {
                    let eof_input = input.clone();
                    input.read_exactly(5).and_then(move |echoed| {
                        assert_eq!(echoed.as_slice(), b"hello");
                        eof_input
                            .read()
                            .then(|buf| assert!(buf.is_empty(), "client sees EOF"))
                    })
                })
        });

        // Datagram path: one message between two local channels.
        let addr_a: SocketAddr = "127.0.0.1:9010".parse().unwrap();
        let addr_b: SocketAddr = "127.0.0.1:9011".parse().unwrap();
        let udp_a = net::make_udp_channel(addr_a).expect("udp bind");
        let udp_b = net::make_udp_channel(addr_b).expect("udp bind");
        let udp_side = udp_b
            .send(addr_a, Buf::from_slice(b"ping"))
            .and_then(move |sent| {
                assert_eq!(sent, 4);
                udp_a.receive().then(move |(data, from)| {
                    assert_eq!(data.as_slice(), b"ping");
                    assert_eq!(from, addr_b);
                })
            });

        when_all(vec![
            server_side.then(|_| ()),
            client_side.then(|_| ()),
            udp_side,
        ])
        // The listener must stay open until both sides are done.
        .then(move |_| drop(server))
    });
    assert_eq!(code, 0);
}
