use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use rawpath_core::frame::{
    HeaderOptions, MacAddress, TcpFlags, calculate_header_backfill, checksum, parse_ethernet,
    transport_checksum, write_headers,
};
use rawpath_core::route::Route;
use std::hint::black_box;

fn route(local: &str, remote: &str) -> Route {
    let mut route = Route::new(local.parse().unwrap(), remote.parse().unwrap());
    route.local_link_layer_address = MacAddress([0x02, 0, 0, 0, 0, 0x01]);
    route.next_hop_link_layer_address = MacAddress([0x02, 0, 0, 0, 0, 0x02]);
    route
}

/// Frame `payload_len` bytes for `route` and return the finished frame.
fn build_frame(route: &Route, payload_len: usize, options: &HeaderOptions) -> Vec<u8> {
    let is_ipv6 = route.remote_address.is_ipv6();
    let backfill = calculate_header_backfill(is_ipv6, options.use_tcp);
    let mut buf = vec![0x5A; backfill + payload_len];
    let start = write_headers(route, &mut buf, backfill, payload_len, options).unwrap();
    buf.drain(..start);
    buf
}

fn bench_checksum(c: &mut Criterion) {
    let sizes: Vec<(usize, &str)> = vec![
        (20, "20_bytes"),
        (64, "64_bytes"),
        (512, "512_bytes"),
        (1500, "1500_bytes"),
    ];

    let mut group = c.benchmark_group("checksum");
    for (size, name) in sizes {
        let data = vec![0xA5; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(name, |b| b.iter(|| checksum(black_box(&data))));
    }
    group.finish();

    let segment = vec![0x3C; 1208];
    let src = "10.0.0.1".parse().unwrap();
    let dst = "10.0.0.2".parse().unwrap();
    let mut group = c.benchmark_group("transport_checksum");
    group.throughput(Throughput::Bytes(segment.len() as u64));
    group.bench_function("udp_ipv4_1208_bytes", |b| {
        b.iter(|| transport_checksum(black_box(src), black_box(dst), 17, black_box(&segment)))
    });
    group.finish();
}

fn bench_write_headers(c: &mut Criterion) {
    let cases = [
        ("udp_ipv4", route("10.0.0.1:443", "10.0.0.2:50000"), false),
        ("udp_ipv6", route("[fd00::1]:443", "[fd00::2]:50000"), false),
        ("tcp_ipv4", route("10.0.0.1:443", "10.0.0.2:50000"), true),
    ];

    let mut group = c.benchmark_group("write_headers");
    group.throughput(Throughput::Bytes(1200));
    for (name, route, use_tcp) in cases {
        let options = HeaderOptions {
            use_tcp,
            flags: TcpFlags::from_bits(TcpFlags::ACK),
            ..HeaderOptions::default()
        };
        let backfill = calculate_header_backfill(route.remote_address.is_ipv6(), use_tcp);
        let mut buf = vec![0u8; backfill + 1200];
        group.bench_function(name, |b| {
            b.iter(|| {
                write_headers(
                    black_box(&route),
                    black_box(&mut buf),
                    backfill,
                    1200,
                    black_box(&options),
                )
            })
        });
    }

    let offloaded = HeaderOptions {
        skip_l3_checksum: true,
        skip_l4_checksum: true,
        ..HeaderOptions::default()
    };
    let route = route("10.0.0.1:443", "10.0.0.2:50000");
    let backfill = calculate_header_backfill(false, false);
    let mut buf = vec![0u8; backfill + 1200];
    group.bench_function("udp_ipv4_offloaded", |b| {
        b.iter(|| write_headers(black_box(&route), black_box(&mut buf), backfill, 1200, &offloaded))
    });
    group.finish();
}

fn bench_parse(c: &mut Criterion) {
    let udp4 = build_frame(
        &route("10.0.0.2:50000", "10.0.0.1:443"),
        1200,
        &HeaderOptions::default(),
    );
    let udp6 = build_frame(
        &route("[fd00::2]:50000", "[fd00::1]:443"),
        1200,
        &HeaderOptions::default(),
    );
    let tcp4 = build_frame(
        &route("10.0.0.2:50000", "10.0.0.1:443"),
        1200,
        &HeaderOptions {
            use_tcp: true,
            flags: TcpFlags::from_bits(TcpFlags::ACK),
            ..HeaderOptions::default()
        },
    );

    let mut group = c.benchmark_group("parse_ethernet");
    for (name, frame) in [("udp_ipv4", &udp4), ("udp_ipv6", &udp6), ("tcp_ipv4", &tcp4)] {
        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_function(name, |b| b.iter(|| parse_ethernet(black_box(frame))));
    }
    group.finish();
}

criterion_group!(benches, bench_checksum, bench_write_headers, bench_parse);
criterion_main!(benches);
