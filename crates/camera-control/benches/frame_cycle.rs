use camera_capture::device::cid;
use camera_capture::MockDevice;
use camera_control::{
    CameraConfig, CameraControl, CameraEvent, CameraParameter, ControlDescriptor, SessionId,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn bench_dequeue_release(c: &mut Criterion) {
    let (control, mut events) = CameraControl::new(MockDevice::new(), CameraConfig::default());
    control.load().unwrap();
    control.start(SessionId(1)).unwrap();
    while events.try_recv().is_ok() {}

    c.bench_function("dequeue_release", |b| {
        b.iter(|| {
            control.dequeue_frame().unwrap();
            if let Ok(CameraEvent::FrameReady(frame)) = events.try_recv() {
                black_box(frame.with_data(|data| data.len()));
                frame.release();
            }
        })
    });
}

fn bench_mapper(c: &mut Criterion) {
    let descriptor = ControlDescriptor {
        parameter: CameraParameter::Brightness,
        control_id: cid::BRIGHTNESS,
        minimum: -128,
        maximum: 127,
    };

    c.bench_function("to_native", |b| {
        b.iter(|| {
            for value in 0..=100 {
                black_box(descriptor.to_native(black_box(value)));
            }
        })
    });
}

criterion_group!(benches, bench_dequeue_release, bench_mapper);
criterion_main!(benches);
