mod support;

use std::path::Path;
use std::process::{Command, Output};

use support::*;

fn psmux(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_psmux"))
        .args(args)
        .output()
        .expect("Failed to run CLI")
}

fn write_inputs(dir: &Path, frames: usize) -> (String, String) {
    let video: Vec<u8> = (0..frames)
        .flat_map(|i| {
            let pic = if i % 6 == 0 { Pic::I } else { Pic::P };
            mpeg2_picture((i % 6) as u16, pic, 4_000, (i == 0).then_some(3))
        })
        .collect();
    // 24 ms per frame, comfortably longer than the video
    let audio = mp2_frame().repeat(frames * 2);

    let video_path = dir.join("video.m2v");
    let audio_path = dir.join("audio.mp2");
    std::fs::write(&video_path, video).unwrap();
    std::fs::write(&audio_path, audio).unwrap();
    (
        video_path.to_str().unwrap().to_string(),
        audio_path.to_str().unwrap().to_string(),
    )
}

/// Test CLI help output
#[test]
fn cli_help_works() {
    let output = psmux(&["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("mux"));
    assert!(stdout.contains("info"));
    assert!(stdout.contains("profiles"));
}

#[test]
fn cli_mux_dvd_json() {
    let temp_dir = tempfile::tempdir().unwrap();
    let (video, audio) = write_inputs(temp_dir.path(), 24);
    let output_path = temp_dir.path().join("out.vob");

    let output = psmux(&[
        "--no-progress",
        "--json",
        "mux",
        "--video",
        &video,
        "--audio",
        &audio,
        "--format",
        "dvd",
        "--output",
        output_path.to_str().unwrap(),
    ]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let stats: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let written = std::fs::read(&output_path).unwrap();
    assert_eq!(stats["bytes_written"].as_u64(), Some(written.len() as u64));
    assert_eq!(stats["video_frames"].as_u64(), Some(24));
    assert_eq!(stats["audio_frames"].as_u64(), Some(48));

    let packs = parse_packs(&written);
    assert!(packs[0].has(0xbf));
    assert!(packs.last().unwrap().ends_stream);
    assert_eq!((written.len() - 4) % 2048, 0);
}

#[test]
fn cli_mux_with_options() {
    let temp_dir = tempfile::tempdir().unwrap();
    let (video, _) = write_inputs(temp_dir.path(), 12);
    let output_path = temp_dir.path().join("out.mpg");

    let output = psmux(&[
        "--no-progress",
        "mux",
        "--video",
        &video,
        "--opts",
        "format=mpeg1:size=4096",
        "--output",
        output_path.to_str().unwrap(),
    ]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Packs:"));

    let written = std::fs::read(&output_path).unwrap();
    let packs = parse_packs(&written);
    assert!(packs.iter().all(|p| !p.mpeg2 && p.size == 4096));
}

#[test]
fn cli_mux_requires_an_input() {
    let temp_dir = tempfile::tempdir().unwrap();
    let output_path = temp_dir.path().join("out.mpg");
    let output = psmux(&["mux", "--output", output_path.to_str().unwrap()]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--video or --audio"));
}

#[test]
fn cli_info_reports_streams() {
    let temp_dir = tempfile::tempdir().unwrap();
    let (video, audio) = write_inputs(temp_dir.path(), 12);

    let output = psmux(&["--json", "info", &video]);
    assert!(output.status.success());
    let info: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(info["kind"], "video");
    assert_eq!(info["codec"], "MPEG-2");
    assert_eq!(info["frames"].as_u64(), Some(12));
    assert_eq!(info["frame_rate_code"].as_u64(), Some(3));

    let output = psmux(&["--json", "info", &audio]);
    assert!(output.status.success());
    let info: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(info["codec"], "MP2");
    assert_eq!(info["frames"].as_u64(), Some(24));
    assert_eq!(info["sample_rate"].as_u64(), Some(48_000));
}

#[test]
fn cli_lists_profiles() {
    let output = psmux(&["--json", "profiles"]);
    assert!(output.status.success());
    let profiles: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let names: Vec<&str> = profiles
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["mpeg1", "mpeg2", "dvd", "xvcd", "xsvcd"]);
}
