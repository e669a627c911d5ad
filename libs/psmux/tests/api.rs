//! Session lifecycle and stream registration through the public API.

mod support;

use psmux::api::{AudioCodec, AudioParams, Muxer, MuxerBuilder, VideoCodec, VideoParams};
use psmux::config::MuxerConfig;
use psmux::error::MuxError;
use support::*;

#[test]
fn registration_closes_after_first_frames() {
    let mut muxer = Muxer::new(Vec::new(), &MuxerConfig::default());
    let audio = muxer
        .register_audio(AudioParams::new(AudioCodec::Mp2, 48_000))
        .unwrap();
    let video = muxer
        .register_video(VideoParams::new(VideoCodec::Mpeg2))
        .unwrap();
    assert_eq!((audio.index(), video.index()), (0, 1));

    // still open: the video stream has not spoken
    muxer
        .write_frame(audio, &mp2_frame(), false, None, None)
        .unwrap();
    let late = muxer
        .register_audio(AudioParams::new(AudioCodec::Mp2, 48_000))
        .unwrap();
    assert_eq!(late.index(), 2);

    muxer
        .write_frame(video, &mpeg2_picture(0, Pic::I, 2_000, Some(3)), true, None, None)
        .unwrap();
    muxer
        .write_frame(late, &mp2_frame(), false, None, None)
        .unwrap();
    assert!(matches!(
        muxer.register_audio(AudioParams::new(AudioCodec::Mp2, 48_000)),
        Err(MuxError::RegistrationClosed)
    ));
    muxer.finalize().unwrap();
}

#[test]
fn finalize_opens_a_silent_session() {
    let mut muxer = MuxerBuilder::new(Vec::new())
        .video(VideoParams::new(VideoCodec::Mpeg2))
        .audio(AudioParams::new(AudioCodec::Mp2, 48_000))
        .build()
        .unwrap();
    let audio = muxer.audio_handles()[0];
    muxer
        .write_frame(audio, &mp2_frame().repeat(4), false, None, None)
        .unwrap();
    // video never delivered; the held audio is still written
    let stats = muxer.finalize().unwrap();
    assert_eq!(stats.video_frames, 0);
    assert_eq!(stats.audio_frames, 4);
    let out = muxer.into_inner();
    let packs = parse_packs(&out);
    assert_eq!(elementary_stream(&out, &packs, 0xc0, 0), mp2_frame().repeat(4));
    assert!(packs.last().unwrap().ends_stream);
}

#[test]
fn audio_streams_get_their_own_ids() {
    let mut muxer = MuxerBuilder::new(Vec::new())
        .options("format=dvd")
        .audio(AudioParams::new(AudioCodec::Ac3, 48_000))
        .audio(AudioParams::new(AudioCodec::Mp2, 48_000))
        .audio(AudioParams::new(AudioCodec::Ac3, 48_000))
        .build()
        .unwrap();
    let handles = muxer.audio_handles();
    muxer
        .write_frame(handles[0], &ac3_frame().repeat(2), false, None, None)
        .unwrap();
    muxer
        .write_frame(handles[1], &mp2_frame().repeat(2), false, None, None)
        .unwrap();
    muxer
        .write_frame(handles[2], &ac3_frame().repeat(2), false, None, None)
        .unwrap();
    muxer.finalize().unwrap();
    let out = muxer.into_inner();
    let packs = parse_packs(&out);

    let substreams: std::collections::BTreeSet<u8> = packets_of(&packs, 0xbd)
        .iter()
        .map(|p| out[p.payload.start])
        .collect();
    assert_eq!(substreams.into_iter().collect::<Vec<_>>(), vec![0x80, 0x81]);
    assert_eq!(elementary_stream(&out, &packs, 0xc0, 0), mp2_frame().repeat(2));
}

#[test]
fn mpeg4_with_aac_gets_a_stream_map() {
    let mut muxer = MuxerBuilder::new(Vec::new())
        .video(VideoParams::new(VideoCodec::Mpeg4))
        .audio(AudioParams::new(AudioCodec::Aac, 48_000))
        .build()
        .unwrap();
    let video = muxer.video_handle().unwrap();
    let audio = muxer.audio_handles()[0];

    let mut video_es = Vec::new();
    for i in 0..20u32 {
        let coding_type = if i % 10 == 0 { 0 } else { 1 };
        let mut frame = if i == 0 { mpeg4_vol(25) } else { Vec::new() };
        frame.extend_from_slice(&mpeg4_vop(coding_type, i % 25, 25, 2_500));
        muxer.write_frame(video, &frame, coding_type == 0, None, None).unwrap();
        video_es.extend_from_slice(&frame);
    }
    // 1024 samples per 400 byte frame, a little over 0.8 s
    let audio_es = aac_frame(400).repeat(40);
    muxer.write_frame(audio, &audio_es, false, None, None).unwrap();
    let stats = muxer.finalize().unwrap();
    let out = muxer.into_inner();
    let packs = parse_packs(&out);

    let psm = packs[0]
        .packets
        .iter()
        .find(|p| p.stream_id == 0xbc)
        .expect("program stream map in the header pack");
    let entries: Vec<(u8, u8)> = (0..2)
        .map(|i| {
            let at = psm.offset + 12 + 10 * i;
            (out[at], out[at + 1])
        })
        .collect();
    assert_eq!(entries, vec![(0x10, 0xe0), (0x0f, 0xc0)]);

    assert_eq!(elementary_stream(&out, &packs, 0xe0, 0), video_es);
    assert_eq!(elementary_stream(&out, &packs, 0xc0, 0), audio_es);
    assert_eq!(stats.video_frames, 20);
    assert_eq!(stats.audio_frames, 40);

    // the first VOP is presented one inferred frame after its decode time
    let first = packets_of(&packs, 0xe0)
        .into_iter()
        .find_map(|p| p.pts.map(|pts| (pts, p.dts)))
        .unwrap();
    assert_eq!(first, (18_000 + 3_600, Some(18_000)));
}

#[test]
fn no_stream_map_for_plain_mpeg() {
    let mut muxer = MuxerBuilder::new(Vec::new())
        .audio(AudioParams::new(AudioCodec::Mp2, 48_000))
        .build()
        .unwrap();
    let audio = muxer.audio_handles()[0];
    muxer
        .write_frame(audio, &mp2_frame().repeat(3), false, None, None)
        .unwrap();
    muxer.finalize().unwrap();
    let out = muxer.into_inner();
    assert_eq!(count_code(&out, 0xbc), 0);
    assert_eq!(count_code(&out, 0xbb), 1);
}

#[test]
fn mpeg1_profile_writes_mpeg1_packs() {
    let mut muxer = MuxerBuilder::new(Vec::new())
        .options("format=mpeg1")
        .video(VideoParams::new(VideoCodec::Mpeg1))
        .build()
        .unwrap();
    let video = muxer.video_handle().unwrap();
    muxer
        .write_frame(video, &mpeg2_picture(0, Pic::I, 5_000, Some(3)), true, None, None)
        .unwrap();
    muxer.finalize().unwrap();
    let out = muxer.into_inner();
    let packs = parse_packs(&out);
    assert!(packs.iter().all(|p| !p.mpeg2 && p.size == 2048));
    let first = packets_of(&packs, 0xe0).into_iter().next().unwrap();
    assert_eq!(first.pts, Some(18_000));
}

#[test]
fn unknown_option_is_a_warning_not_an_error() {
    let config = MuxerConfig::from_options("format=dvd:frobnicate=3:muxrate=0");
    let resolved = config.resolve();
    assert_eq!(resolved.profile, psmux::FormatProfile::Dvd);
    assert_eq!(resolved.muxrate, 10_080 * 125);
    assert_eq!(resolved.warnings.len(), 2);
}
