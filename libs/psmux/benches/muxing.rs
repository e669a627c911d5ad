use criterion::{Criterion, black_box, criterion_group, criterion_main};
use psmux::api::{AudioCodec, AudioParams, MuxerBuilder, VideoCodec, VideoParams};

fn picture(tr: u16, intra: bool, first: bool, len: usize) -> Vec<u8> {
    let mut f = Vec::with_capacity(len);
    if first {
        // 720x576, 25 fps, vbv 112, then a main profile sequence extension
        f.extend_from_slice(&[
            0x00, 0x00, 0x01, 0xb3, 0x2d, 0x02, 0x40, 0x23, 0x17, 0xed, 0x23, 0x80,
        ]);
        f.extend_from_slice(&[0x00, 0x00, 0x01, 0xb5, 0x14, 0x82, 0x00, 0x01, 0x00, 0x00]);
    }
    if intra {
        f.extend_from_slice(&[0x00, 0x00, 0x01, 0xb8, 0x00, 0x08, 0x00, 0x40]);
    }
    let coding_type = if intra { 1 } else { 2 };
    f.extend_from_slice(&[
        0x00,
        0x00,
        0x01,
        0x00,
        (tr >> 2) as u8,
        (((tr & 3) as u8) << 6) | (coding_type << 3),
        0xff,
        0xf8,
    ]);
    f.extend_from_slice(&[0x00, 0x00, 0x01, 0xb5, 0x8f, 0xff, 0xf3, 0x40, 0x00]);
    f.extend_from_slice(&[0x00, 0x00, 0x01, 0x01]);
    f.resize(len, 0x55);
    f
}

fn mp2_frames(n: usize) -> Vec<u8> {
    let mut frame = vec![0u8; 576];
    frame[..4].copy_from_slice(&[0xff, 0xfd, 0xa4, 0x00]);
    frame.repeat(n)
}

fn bench_video_muxing(c: &mut Criterion) {
    let frames: Vec<Vec<u8>> = (0..1000)
        .map(|i| picture((i % 12) as u16, i % 12 == 0, i == 0, 20_000))
        .collect();
    c.bench_function("mux_1000_mpeg2_frames", |b| {
        b.iter(|| {
            let mut muxer = MuxerBuilder::new(Vec::new())
                .video(VideoParams::new(VideoCodec::Mpeg2))
                .build()
                .expect("build muxer");
            let video = muxer.video_handle().expect("video stream");
            for (i, frame) in frames.iter().enumerate() {
                let _ = muxer.write_frame(video, frame, i % 12 == 0, None, None);
            }
            let _ = muxer.finalize();
            black_box(muxer.into_inner());
        });
    });
}

fn bench_dvd_with_audio(c: &mut Criterion) {
    let frames: Vec<Vec<u8>> = (0..1000)
        .map(|i| picture((i % 12) as u16, i % 12 == 0, i == 0, 20_000))
        .collect();
    // 48 ms of audio per 40 ms picture
    let audio = mp2_frames(2);
    c.bench_function("mux_1000_dvd_frames_with_audio", |b| {
        b.iter(|| {
            let mut muxer = MuxerBuilder::new(Vec::new())
                .options("format=dvd")
                .video(VideoParams::new(VideoCodec::Mpeg2))
                .audio(AudioParams::new(AudioCodec::Mp2, 48_000))
                .build()
                .expect("build muxer");
            let video = muxer.video_handle().expect("video stream");
            let sound = muxer.audio_handles()[0];
            for (i, frame) in frames.iter().enumerate() {
                let _ = muxer.write_frame(video, frame, i % 12 == 0, None, None);
                let _ = muxer.write_frame(sound, &audio, false, None, None);
            }
            let _ = muxer.finalize();
            black_box(muxer.into_inner());
        });
    });
}

criterion_group!(benches, bench_video_muxing, bench_dvd_with_audio);
criterion_main!(benches);
