//! Wire-format benchmarks for the UDP datapath.
//!
//! Benchmarks checksum folding, header encode/parse, and the
//! pseudo-header computation that sits on every send and receive.
//!
//! Run with: `cargo bench --bench endpoint_benchmarks`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use skein_core::wire::{self, UdpHeader, UDP_PROTOCOL_NUMBER};
use skein_core::{Address, ByteChunks};

/// Benchmark the internet checksum over datagram-sized payloads.
fn bench_checksum(c: &mut Criterion) {
    let mut group = c.benchmark_group("checksum");

    for size in [64usize, 512, 1460, 8192] {
        let data = vec![0xa5u8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("contiguous", size), &data, |b, data| {
            b.iter(|| wire::checksum(black_box(data), 0));
        });

        // The same bytes split across fragments, as a vectorised payload
        // would carry them.
        let mut chunks = ByteChunks::new();
        for fragment in data.chunks(size / 4 + 1) {
            chunks.push_chunk(fragment.to_vec());
        }
        group.bench_with_input(BenchmarkId::new("fragmented", size), &chunks, |b, chunks| {
            b.iter(|| chunks.fold_checksum(black_box(0)));
        });
    }

    group.finish();
}

/// Benchmark header encode and parse.
fn bench_header(c: &mut Criterion) {
    let hdr = UdpHeader {
        src_port: 49152,
        dst_port: 53,
        length: 1468,
        checksum: 0x1c2d,
    };
    let bytes = hdr.encode();

    c.bench_function("header_encode", |b| b.iter(|| black_box(&hdr).encode()));
    c.bench_function("header_parse", |b| {
        b.iter(|| UdpHeader::parse(black_box(&bytes)).unwrap())
    });
}

/// Benchmark the pseudo-header checksum for both address families.
fn bench_pseudo_header(c: &mut Criterion) {
    let v4_src = Address::V4([192, 0, 2, 1]);
    let v4_dst = Address::V4([192, 0, 2, 2]);
    let v6_src = Address::V6([0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
    let v6_dst = Address::V6([0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2]);

    c.bench_function("pseudo_header_v4", |b| {
        b.iter(|| {
            wire::pseudo_header_checksum(
                UDP_PROTOCOL_NUMBER,
                black_box(&v4_src),
                black_box(&v4_dst),
                1468,
            )
        })
    });
    c.bench_function("pseudo_header_v6", |b| {
        b.iter(|| {
            wire::pseudo_header_checksum(
                UDP_PROTOCOL_NUMBER,
                black_box(&v6_src),
                black_box(&v6_dst),
                1468,
            )
        })
    });
}

criterion_group!(benches, bench_checksum, bench_header, bench_pseudo_header);
criterion_main!(benches);
