use std::net::{SocketAddr, UdpSocket};
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

use mill_server::prelude::*;

const TIMEOUT: Duration = Duration::from_secs(5);

struct Capture {
    tx: Mutex<mpsc::Sender<(Vec<u8>, SocketAddr)>>,
}

impl UdpHandler for Capture {
    fn channel_read(&self, _ctx: &UdpContext, data: &[u8], from: SocketAddr) -> Result<()> {
        let _ = self.tx.lock().unwrap().send((data.to_vec(), from));
        Ok(())
    }
}

fn start() -> (UdpServer, mpsc::Receiver<(Vec<u8>, SocketAddr)>) {
    let (tx, rx) = mpsc::channel();
    let server = UdpServer::builder()
        .handler(Capture { tx: Mutex::new(tx) })
        .bind("127.0.0.1:0".parse().unwrap())
        .start()
        .unwrap();
    (server, rx)
}

#[test]
fn scenario_d_datagram_is_delivered_with_sender() {
    let (server, rx) = start();
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    sender
        .send_to(&[0x01, 0x02, 0x03], server.local_address().unwrap())
        .unwrap();

    let (data, from) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(data, vec![0x01, 0x02, 0x03]);
    assert_eq!(from, sender.local_addr().unwrap());

    server.close();
    server.await_termination();
}

#[test]
fn every_datagram_is_one_callback() {
    let (server, rx) = start();
    let target = server.local_address().unwrap();
    let sender = UdpSender::new(false).unwrap();

    for i in 0..20u8 {
        sender.send_data(&[i; 3], target).unwrap();
    }
    let mut received: Vec<Vec<u8>> = (0..20)
        .map(|_| rx.recv_timeout(TIMEOUT).unwrap().0)
        .collect();
    received.sort();
    let expected: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i; 3]).collect();
    assert_eq!(received, expected);

    server.close();
    server.await_termination();
    assert!(server.is_closed());
}

#[test]
fn close_before_start_and_after_start() {
    let (tx, _rx) = mpsc::channel();
    let idle = UdpServer::builder()
        .handler(Capture { tx: Mutex::new(tx) })
        .build()
        .unwrap();
    idle.close();
    idle.await_termination();
    assert!(matches!(idle.start(), Err(NetworkError::Closed)));

    let (server, _rx) = start();
    let address = server.local_address().unwrap();
    server.close();
    server.close();
    server.await_termination();
    assert_eq!(server.local_address().unwrap(), address);
    assert!(server.workers().is_empty());
}
