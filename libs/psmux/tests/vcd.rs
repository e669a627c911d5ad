//! Extended SVCD: 2324 byte sectors and fixed decoder buffer bounds.

mod support;

use psmux::api::{AudioCodec, AudioParams, MuxerBuilder, VideoCodec, VideoParams};
use support::*;

fn mux_xsvcd(options: &str) -> Vec<u8> {
    let mut muxer = MuxerBuilder::new(Vec::new())
        .options(options)
        .video(VideoParams::new(VideoCodec::Mpeg2))
        .audio(AudioParams::new(AudioCodec::Mp2, 48_000))
        .build()
        .unwrap();
    let video = muxer.video_handle().unwrap();
    let audio = muxer.audio_handles()[0];
    for group in 0..2 {
        for i in 0..6 {
            let pic = if i == 0 { Pic::I } else { Pic::P };
            let header = (group == 0 && i == 0).then_some(3);
            let frame = mpeg2_picture(i as u16, pic, 4_000, header);
            muxer.write_frame(video, &frame, i == 0, None, None).unwrap();
            muxer
                .write_frame(audio, &mp2_frame().repeat(2), false, None, None)
                .unwrap();
        }
    }
    muxer.finalize().unwrap();
    muxer.into_inner()
}

#[test]
fn xsvcd_video_buffer_matches_system_header() {
    let out = mux_xsvcd("format=xsvcd");
    let packs = parse_packs(&out);

    let bounds = system_header_bounds(&out);
    assert_eq!(bounds, vec![(0xe0, 230 * 1024), (0xc0, 4 * 1024)]);

    let video = packets_of(&packs, 0xe0);
    assert_eq!(std_buffer(&out, &video[0]), Some(230 * 1024));
    let audio = packets_of(&packs, 0xc0);
    assert_eq!(std_buffer(&out, &audio[0]), Some(4 * 1024));
}

#[test]
fn xsvcd_buffer_options_reach_both_declarations() {
    let out = mux_xsvcd("format=xsvcd:vbuf_size=200:abuf_size=8");
    let packs = parse_packs(&out);

    let bounds = system_header_bounds(&out);
    assert_eq!(bounds, vec![(0xe0, 200 * 1024), (0xc0, 8 * 1024)]);
    let video = packets_of(&packs, 0xe0);
    assert_eq!(std_buffer(&out, &video[0]), Some(200 * 1024));
    let audio = packets_of(&packs, 0xc0);
    assert_eq!(std_buffer(&out, &audio[0]), Some(8 * 1024));
}

#[test]
fn xsvcd_packs_are_sectors() {
    let out = mux_xsvcd("format=xsvcd");
    let packs = parse_packs(&out);
    let (last, body) = packs.split_last().unwrap();
    for pack in body {
        assert_eq!(pack.size, 2324, "pack at {}", pack.offset);
        assert!(pack.mpeg2);
    }
    assert!(last.ends_stream);
}
