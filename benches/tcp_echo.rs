use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mill_server::prelude::*;
use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpStream},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

struct EchoHandler {
    bytes_received: Arc<AtomicU64>,
}

impl TcpHandler for EchoHandler {
    fn channel_read(&self, ctx: &mut TcpContext) -> Result<()> {
        if let Some(data) = ctx.take_bytes() {
            self.bytes_received
                .fetch_add(data.len() as u64, Ordering::Relaxed);
            ctx.write_bytes(&data)?;
        }
        Ok(())
    }
}

/// Closes the server when the benchmark group is done with it.
struct ServerHandle {
    server: TcpServer,
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.server.close();
        self.server.await_termination();
    }
}

fn setup_server(workers: usize) -> (SocketAddr, ServerHandle, Arc<AtomicU64>) {
    let bytes_received = Arc::new(AtomicU64::new(0));
    let server = TcpServer::builder()
        .handler(EchoHandler {
            bytes_received: bytes_received.clone(),
        })
        .worker_threads(workers)
        .bind("127.0.0.1:0".parse().unwrap())
        .start()
        .unwrap();
    let addr = server.local_address().unwrap();
    (addr, ServerHandle { server }, bytes_received)
}

fn bench_tcp_echo_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("tcp_echo");
    group.sample_size(20);

    for size in [64usize, 1024, 8192] {
        group.throughput(Throughput::Bytes((size * 100) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let (addr, _handle, _bytes) = setup_server(1);
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.set_nodelay(true).unwrap();

            let data = vec![42u8; size];
            let mut response = vec![0u8; size];

            b.iter(|| {
                for _ in 0..100 {
                    stream.write_all(&data).unwrap();
                    stream.read_exact(&mut response).unwrap();
                }
                black_box(&response);
            });
        });
    }
    group.finish();
}

fn bench_tcp_concurrent_connections(c: &mut Criterion) {
    let mut group = c.benchmark_group("tcp_concurrent");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(15));

    for conn_count in [10, 50] {
        group.bench_with_input(
            BenchmarkId::from_parameter(conn_count),
            &conn_count,
            |b, &count| {
                let (addr, _handle, _bytes) = setup_server(4);

                b.iter(|| {
                    let handles: Vec<_> = (0..count)
                        .map(|_| {
                            thread::spawn(move || {
                                if let Ok(mut stream) = TcpStream::connect(addr) {
                                    let _ = stream.set_nodelay(true);
                                    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
                                    for _ in 0..3 {
                                        if stream.write_all(b"test").is_err() {
                                            break;
                                        }
                                        let mut buf = [0u8; 4];
                                        if stream.read_exact(&mut buf).is_err() {
                                            break;
                                        }
                                    }
                                }
                            })
                        })
                        .collect();
                    for h in handles {
                        let _ = h.join();
                    }
                });
            },
        );
    }
    group.finish();
}

criterion_group!(
    tcp_benches,
    bench_tcp_echo_throughput,
    bench_tcp_concurrent_connections,
);
criterion_main!(tcp_benches);
