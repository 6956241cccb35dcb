use anyhow::Result;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use bip15x::codec::{DecodeOutcome, FrameDecoder, FrameEncoder};
use bip15x::protocol::constants::MAX_PACKET_PAYLOAD;
use bip15x::protocol::{DirectionalKey, RekeyPolicy, SessionCipher};

/// Two active ciphers facing each other; rekeying is left to the benchmark
fn cipher_pair() -> Result<(SessionCipher, SessionCipher)> {
    let policy = RekeyPolicy {
        max_bytes: u64::MAX,
        max_age: 1e12,
    };
    let a_to_b = || DirectionalKey::derive(&[1u8; 32], &[2u8; 33], &[3u8; 33]);
    let b_to_a = || DirectionalKey::derive(&[4u8; 32], &[5u8; 33], &[6u8; 33]);
    let (mut a, mut b) = (SessionCipher::new(policy), SessionCipher::new(policy));
    a.activate(a_to_b()?, b_to_a()?, 0.0);
    b.activate(b_to_a()?, a_to_b()?, 0.0);
    Ok((a, b))
}

fn round_trip(
    enc: &mut FrameEncoder,
    dec: &mut FrameDecoder,
    tx: &mut SessionCipher,
    rx: &mut SessionCipher,
    msg: &[u8],
) -> Result<Vec<u8>> {
    let wire = enc.encode(msg, Some(tx))?.concat();
    match dec.decode(&wire, Some(rx)) {
        DecodeOutcome::CompleteMessage(m) => Ok(m),
        other => anyhow::bail!("unexpected outcome {other:?}"),
    }
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("sealed message");
    for len in [64usize, 4096, 1 << 20] {
        let msg = vec![0xa5u8; len];
        let (mut tx, mut rx) = cipher_pair().unwrap();
        let mut enc = FrameEncoder::new(MAX_PACKET_PAYLOAD);
        let mut dec = FrameDecoder::new(MAX_PACKET_PAYLOAD, 1 << 24);

        group.throughput(Throughput::Bytes(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &msg, |bench, msg| {
            bench.iter(|| {
                round_trip(&mut enc, &mut dec, &mut tx, &mut rx, black_box(msg)).unwrap()
            })
        });
    }
    group.finish();

    c.bench_function("plaintext handshake frame", |bench| {
        let mut dec = FrameDecoder::new(MAX_PACKET_PAYLOAD, 1 << 24);
        let frame = bip15x::codec::encode_packet(
            bip15x::msgs::MsgType::EncInit,
            0,
            &[2u8; 34],
            None,
        )
        .unwrap();
        bench.iter(|| {
            assert!(matches!(
                dec.decode(black_box(&frame), None),
                DecodeOutcome::HandshakeFrame(_)
            ))
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
