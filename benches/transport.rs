use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use synthbridge::{
    AudioStreamBuffer, ControlQueue, ControlRecord, EngineConfig, OutputCallback, PolySynth, SynthEngine,
    TransportStats, UnderrunPolicy,
};

pub fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("AudioStreamBuffer write+read 128", |b| {
        let (mut writer, mut reader) = AudioStreamBuffer::new(4096, 2).unwrap();
        let block = vec![0.5f32; 256];
        let mut planes = [vec![0.0f32; 128], vec![0.0f32; 128]];

        b.iter(move || {
            writer.write(black_box(&block));
            reader.read(&mut planes, 128)
        })
    });

    c.bench_function("ControlQueue write+drain 16", |b| {
        let (mut producer, mut consumer) = ControlQueue::new(1024, 16).unwrap();

        b.iter(move || {
            for note in 60..68 {
                producer.write(ControlRecord::NoteOn { note, velocity: 100 });
                producer.write(ControlRecord::NoteOff { note });
            }
            consumer.drain(|record| {
                black_box(record);
            })
        })
    });

    c.bench_function("OutputCallback.process() 128", |b| {
        let (mut writer, reader) = AudioStreamBuffer::new(4096, 2).unwrap();
        let stats = Arc::new(TransportStats::default());
        let connected = Arc::new(AtomicBool::new(true));
        let mut callback = OutputCallback::new(reader, 2, 4096, UnderrunPolicy::Silence, stats, connected);
        let block = vec![0.25f32; 256];
        let mut data = vec![0.0f32; 256];

        b.iter(move || {
            writer.write(&block);
            callback.process(black_box(&mut data));
        })
    });

    c.bench_function("PolySynth.render() 8 voices", |b| {
        let mut synth = PolySynth::new(&EngineConfig {
            sample_rate: 48_000,
            block_size: 128,
        });
        for note in [48u8, 52, 55, 60, 64, 67, 72, 76] {
            synth.note_on(note, 100);
        }
        let mut left = vec![0.0f32; 128];
        let mut right = vec![0.0f32; 128];

        b.iter(move || synth.render(&mut left, &mut right))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
