use criterion::{black_box, criterion_group, criterion_main, Criterion};

use ferrite::codec::{BinaryDecoder, BinaryEncoder, Decoder, Encoder};
use ferrite::io::buffer::Buffer;

const VALUES: [i64; 10] = [
    0,
    1,
    -1,
    63,
    64,
    1 << 20,
    -(1 << 20),
    1 << 40,
    i64::MIN,
    i64::MAX,
];

fn varint_round_trip(c: &mut Criterion) {
    c.bench_function("varint_round_trip", |b| {
        b.iter(|| {
            let mut buffer = Buffer::new();
            {
                let mut encoder = BinaryEncoder::new(&mut buffer);
                for value in VALUES.iter() {
                    encoder.encode_i64(None, *value).unwrap();
                }
            }

            let mut decoder = BinaryDecoder::new(buffer.as_slice());
            let mut total = 0i64;
            while decoder.more() {
                total = total.wrapping_add(decoder.decode_i64(None).unwrap());
            }
            black_box(total)
        })
    });
}

criterion_group!(benches, varint_round_trip);
criterion_main!(benches);
