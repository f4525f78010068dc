//! Benchmarks for DNS message decode/encode and the streaming structural
//! view used by the truncator.
//!
//! Measures how quickly we can parse and rebuild a wire-format message.

use criterion::{black_box, BenchmarkId, Criterion, Throughput};

use dnsrelay::dns::{decode_message, encode_message, structural_view, truncate_message};

fn build_query() -> Vec<u8> {
    let mut query = Vec::new();
    query.extend_from_slice(&[0x12, 0x34]); // id
    query.extend_from_slice(&[0x01, 0x00]); // flags: standard query, RD set
    query.extend_from_slice(&[0x00, 0x01]); // qdcount
    query.extend_from_slice(&[0x00, 0x00]); // ancount
    query.extend_from_slice(&[0x00, 0x00]); // nscount
    query.extend_from_slice(&[0x00, 0x00]); // arcount
    query.extend_from_slice(&[0x07]);
    query.extend_from_slice(b"example");
    query.extend_from_slice(&[0x03]);
    query.extend_from_slice(b"com");
    query.extend_from_slice(&[0x00]);
    query.extend_from_slice(&[0x00, 0x01]); // qtype A
    query.extend_from_slice(&[0x00, 0x01]); // qclass IN
    query
}

fn build_response_with_answers(answer_count: usize) -> Vec<u8> {
    let mut response = build_query();
    response[2] = 0x81;
    response[3] = 0x80;
    let ancount = (answer_count as u16).to_be_bytes();
    response[6] = ancount[0];
    response[7] = ancount[1];
    for _ in 0..answer_count {
        response.extend_from_slice(&[0xc0, 0x0c]); // name pointer to the question
        response.extend_from_slice(&[0x00, 0x01]); // type A
        response.extend_from_slice(&[0x00, 0x01]); // class IN
        response.extend_from_slice(&[0x00, 0x00, 0x01, 0x2c]); // ttl
        response.extend_from_slice(&[0x00, 0x04]);
        response.extend_from_slice(&[93, 184, 216, 34]);
    }
    response
}

fn bench_decode(c: &mut Criterion) {
    let query = build_query();
    let response = build_response_with_answers(16);

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Elements(1));
    group.bench_function(BenchmarkId::new("decode_message", "question_only"), |b| {
        b.iter(|| decode_message(black_box(&query)).unwrap())
    });
    group.bench_function(BenchmarkId::new("decode_message", "16_answers"), |b| {
        b.iter(|| decode_message(black_box(&response)).unwrap())
    });
    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let response = build_response_with_answers(16);
    let decoded = decode_message(&response).unwrap();

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(1));
    group.bench_function(BenchmarkId::new("encode_message", "16_answers"), |b| {
        b.iter(|| {
            let mut out = Vec::new();
            encode_message(black_box(&decoded), &mut out).unwrap();
            out
        })
    });
    group.finish();
}

fn bench_structural_view(c: &mut Criterion) {
    let response = build_response_with_answers(16);

    let mut group = c.benchmark_group("structural_view");
    group.throughput(Throughput::Elements(1));
    group.bench_function(BenchmarkId::new("structural_view", "16_answers"), |b| {
        b.iter(|| structural_view(black_box(&response)).unwrap())
    });
    group.finish();
}

fn bench_truncate(c: &mut Criterion) {
    let response = build_response_with_answers(16);
    let limit = response.len() / 2;

    let mut group = c.benchmark_group("truncate");
    group.throughput(Throughput::Elements(1));
    group.bench_function(BenchmarkId::new("truncate_message", "half_size_limit"), |b| {
        b.iter(|| {
            let mut buf = response.clone();
            truncate_message(black_box(&mut buf), limit).unwrap();
            buf
        })
    });
    group.finish();
}

fn main() {
    let mut criterion = Criterion::default().configure_from_args();
    bench_decode(&mut criterion);
    bench_encode(&mut criterion);
    bench_structural_view(&mut criterion);
    bench_truncate(&mut criterion);
    criterion.final_summary();
}
