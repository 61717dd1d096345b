use std::hint::black_box;
use std::io::Cursor;

use criterion::{Criterion, criterion_group, criterion_main};
use piccolo_protocol::{
    DEFAULT_MAX_PAYLOAD_LEN, DEFAULT_SAMPLES_PER_CHANNEL, RegisterValue, SampleBuffer, Snapshot,
    codec::{read_json_frame, write_json_frame},
};

fn snapshot(registers: usize) -> Snapshot {
    (0..registers)
        .map(|i| (format!("register[{}]", i), RegisterValue::Int(i as i64 * 37)))
        .collect()
}

fn sample_buffer_encoding(c: &mut Criterion) {
    let n = DEFAULT_SAMPLES_PER_CHANNEL;
    let buffer = SampleBuffer::new(
        (0..n).map(|i| (i as f32).sin()).collect(),
        (0..n).map(|i| (i as f32).cos()).collect(),
    )
    .expect("channels have equal length");
    let raw = buffer.to_bytes();

    c.bench_function("sample_buffer_to_bytes", |b| {
        b.iter(|| black_box(&buffer).to_bytes())
    });
    c.bench_function("sample_buffer_from_bytes", |b| {
        b.iter(|| SampleBuffer::from_bytes(black_box(&raw), n))
    });
}

fn snapshot_frames(c: &mut Criterion) {
    let state = snapshot(64);
    let mut frame = Vec::new();
    write_json_frame(&mut frame, &state).expect("Writing to vector shouldn't fail");

    c.bench_function("snapshot_write_json_frame", |b| {
        b.iter(|| {
            let mut out = Vec::with_capacity(frame.len());
            write_json_frame(&mut out, black_box(&state)).expect("Writing to vector shouldn't fail");
            out
        })
    });
    c.bench_function("snapshot_read_json_frame", |b| {
        b.iter(|| {
            let mut reader = Cursor::new(black_box(&frame));
            read_json_frame::<Snapshot>(&mut reader, DEFAULT_MAX_PAYLOAD_LEN)
        })
    });
}

criterion_group!(benches, sample_buffer_encoding, snapshot_frames);
criterion_main!(benches);
