use core::{fmt, hint::black_box};
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use futures::stream::FuturesUnordered;
use portable_atomic::{AtomicU64, Ordering};
use std::{
    net::TcpStream,
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};
use tokio::runtime::Builder;
use tokio_stream::StreamExt;
use tonic::{
    codec::CompressionEncoding,
    metadata::MetadataValue,
    transport::{Channel, Uri},
};

mod proto {
    tonic::include_proto!("switchyard");
}

use proto::{Envelope, Frame, Open, Pattern, envelope::Kind, switchyard_client::SwitchyardClient};

#[derive(Clone, Copy, Debug)]
enum Compression {
    None,
    Deflate,
    Gzip,
    Zstd,
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => write!(f, "none"),
            Compression::Deflate => write!(f, "deflate"),
            Compression::Gzip => write!(f, "gzip"),
            Compression::Zstd => write!(f, "zstd"),
        }
    }
}

impl From<Compression> for Option<CompressionEncoding> {
    fn from(value: Compression) -> Self {
        match value {
            Compression::None => None,
            Compression::Deflate => Some(CompressionEncoding::Deflate),
            Compression::Gzip => Some(CompressionEncoding::Gzip),
            Compression::Zstd => Some(CompressionEncoding::Zstd),
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Workload {
    /// Bypasses authentication; measures transport and dispatch overhead.
    Health,
    /// Runs the whole interceptor chain and a store write.
    Create,
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Workload::Health => write!(f, "health"),
            Workload::Create => write!(f, "create"),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct GrpcBenchParams {
    workload: Workload,
    concurrency: usize,
    compression: Compression,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

fn grpc_bench(c: &mut Criterion) {
    let uri = Uri::try_from("http://127.0.0.1:50051").expect("Invalid URI");
    // Start the server. This may require a full compilation so set the timeout
    // high. Adjust features and CLI args to the server as necessary.
    let mut server = Command::new("cargo")
        .args([
            "run",
            "--bin",
            "switchyard-tonic-server",
            "--release",
            "--",
            "--server-addr",
            "127.0.0.1:50051",
            "--auth-tokens",
            "bench:bench:admin",
        ])
        .env("RUST_LOG", "warn")
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .expect("Failed to start switchyard-tonic-server");
    wait_for_port(uri.authority().expect("missing authority").as_str(), 300);

    let workloads = [Workload::Health, Workload::Create];
    let concurrency_cases = [1, 8, 64, 256];
    let compression_cases = [Compression::None, Compression::Zstd, Compression::Gzip];

    // Generate cartesian product of all param combinations
    let mut cases = Vec::new();
    for &workload in &workloads {
        for &concurrency in &concurrency_cases {
            for &compression in &compression_cases {
                cases.push(GrpcBenchParams {
                    workload,
                    concurrency,
                    compression,
                });
            }
        }
    }
    let rt = Builder::new_multi_thread().enable_all().build().unwrap();

    for params in &cases {
        let mut group = c.benchmark_group("grpc/invoke_unary");
        group.throughput(Throughput::Elements(params.concurrency as u64));

        group.bench_function(
            format!(
                "{}/conc/{}/comp/{}",
                params.workload, params.concurrency, params.compression,
            ),
            |b| {
                b.to_async(&rt).iter_custom(|iters| {
                    let uri = uri.clone();
                    async move {
                        let channel = Channel::builder(uri)
                            .connect()
                            .await
                            .expect("Failed to connect to server");

                        let start = Instant::now();

                        for _ in 0..iters {
                            run_grpc_unary_bench(&channel, params).await;
                        }

                        start.elapsed()
                    }
                });
            },
        );

        group.finish();
    }

    if server.kill().is_err() {
        eprintln!("failed to kill server");
    }
}

fn request(workload: Workload) -> Vec<Envelope> {
    let (method, tag, payload) = match workload {
        Workload::Health => ("/switchyard.Health/Check", "text", Vec::new()),
        Workload::Create => {
            let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
            let body = format!(r#"{{"id":"p{id}","name":"Lamp","price_cents":1999}}"#);
            ("/switchyard.Products/Create", "product", body.into_bytes())
        }
    };
    vec![
        Envelope {
            kind: Some(Kind::Open(Open {
                method: method.to_string(),
                pattern: Pattern::Unary.into(),
            })),
        },
        Envelope {
            kind: Some(Kind::Frame(Frame {
                tag: tag.to_string(),
                payload: payload.into(),
            })),
        },
    ]
}

async fn run_grpc_unary_bench(channel: &Channel, params: &GrpcBenchParams) {
    let mut tasks = FuturesUnordered::new();

    for _ in 0..params.concurrency {
        let channel = channel.clone();
        let compression = params.compression;
        let envelopes = request(params.workload);

        tasks.push(tokio::spawn(async move {
            let mut client = SwitchyardClient::new(channel);
            if let Some(encoding) = compression.into() {
                client = client.accept_compressed(encoding).send_compressed(encoding)
            }

            let mut request = tonic::Request::new(tokio_stream::iter(envelopes));
            request.metadata_mut().insert(
                "authorization",
                MetadataValue::from_static("Bearer bench"),
            );
            let mut stream = client
                .invoke(request)
                .await
                .expect("invoke failed")
                .into_inner();

            while let Some(envelope) = stream.next().await {
                black_box(envelope.expect("call failed"));
            }
        }));
    }

    // Wait for all tasks to complete
    while let Some(res) = tasks.next().await {
        res.unwrap();
    }
}

pub fn wait_for_port(addr: &str, timeout_secs: u64) {
    let start = Instant::now();
    while start.elapsed().as_secs() < timeout_secs {
        if TcpStream::connect(addr).is_ok() {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    panic!("Server did not start listening on {}", addr);
}

criterion_group!(grpc_benches, grpc_bench);
criterion_main!(grpc_benches);
