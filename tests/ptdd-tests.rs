//
// Copyright (c) 2025-2026 Jeff Garzik
//
// This file is part of the ptdd-rs project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT
//

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

fn ptdd_bin() -> &'static str {
    env!("CARGO_BIN_EXE_ptdd")
}

fn run_ptdd(args: &[&str]) -> Output {
    Command::new(ptdd_bin())
        .args(args)
        .output()
        .expect("failed to run ptdd")
}

fn run_ptdd_stdin(args: &[&str], stdin_data: &[u8]) -> Output {
    let mut child = Command::new(ptdd_bin())
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn ptdd");
    child
        .stdin
        .take()
        .unwrap()
        .write_all(stdin_data)
        .expect("failed to write stdin");
    child.wait_with_output().expect("failed to wait for ptdd")
}

fn stderr_of(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).to_string()
}

/// src filled with a deterministic non-zero pattern
fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 | 1).collect()
}

fn write_file(path: &Path, data: &[u8]) {
    fs::write(path, data).expect("failed to seed test file");
}

fn scratch_dir() -> (tempfile::TempDir, PathBuf, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src.bin");
    let dst = dir.path().join("dst.bin");
    (dir, src, dst)
}

#[test]
fn test_basic_copy_zero_blocks() {
    let (_dir, src, dst) = scratch_dir();
    write_file(&src, &vec![0u8; 512 * 10]);
    let out = run_ptdd(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=512",
        "count=10",
    ]);
    assert_eq!(out.status.code(), Some(0), "stderr: {}", stderr_of(&out));
    assert_eq!(fs::metadata(&dst).unwrap().len(), 5120);
    let err = stderr_of(&out);
    assert!(err.contains("10+0 records in"), "stderr: {}", err);
    assert!(err.contains("10+0 records out"), "stderr: {}", err);
}

#[test]
fn test_copy_roundtrip_content() {
    let (_dir, src, dst) = scratch_dir();
    let data = patterned(64 * 1024);
    write_file(&src, &data);
    let out = run_ptdd(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=4096",
    ]);
    assert_eq!(out.status.code(), Some(0), "stderr: {}", stderr_of(&out));
    assert_eq!(fs::read(&dst).unwrap(), data);
}

#[test]
fn test_count_limits_copy() {
    let (_dir, src, dst) = scratch_dir();
    let data = patterned(512 * 10);
    write_file(&src, &data);
    let out = run_ptdd(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=512",
        "count=3",
    ]);
    assert_eq!(out.status.code(), Some(0));
    assert_eq!(fs::read(&dst).unwrap(), &data[..1536]);
}

#[test]
fn test_skip_and_seek() {
    let (_dir, src, dst) = scratch_dir();
    let data = patterned(512 * 8);
    write_file(&src, &data);
    let out = run_ptdd(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=512",
        "skip=2",
        "seek=3",
        "count=4",
    ]);
    assert_eq!(out.status.code(), Some(0), "stderr: {}", stderr_of(&out));
    let got = fs::read(&dst).unwrap();
    assert_eq!(got.len(), 512 * 7);
    assert!(got[..512 * 3].iter().all(|&b| b == 0));
    assert_eq!(&got[512 * 3..], &data[512 * 2..512 * 6]);
}

#[test]
fn test_iseek_oseek_aliases() {
    let (_dir, src, dst) = scratch_dir();
    let data = patterned(512 * 4);
    write_file(&src, &data);
    let out = run_ptdd(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=512",
        "iseek=1",
        "oseek=1",
        "count=2",
    ]);
    assert_eq!(out.status.code(), Some(0));
    let got = fs::read(&dst).unwrap();
    assert_eq!(&got[512..512 * 3], &data[512..512 * 3]);
}

#[test]
fn test_different_ibs_obs() {
    let (_dir, src, dst) = scratch_dir();
    let data = patterned(512 * 8);
    write_file(&src, &data);
    let out = run_ptdd(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "ibs=512",
        "obs=1024",
        "bpt=4",
        "count=8",
    ]);
    assert_eq!(out.status.code(), Some(0), "stderr: {}", stderr_of(&out));
    assert_eq!(fs::read(&dst).unwrap(), data);
    let err = stderr_of(&out);
    assert!(err.contains("8+0 records in"), "stderr: {}", err);
    assert!(err.contains("4+0 records out"), "stderr: {}", err);
}

#[test]
fn test_misaligned_bpt_rejected_before_io() {
    let (_dir, src, dst) = scratch_dir();
    write_file(&src, &vec![1u8; 512 * 4]);
    let out = run_ptdd(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "ibs=512",
        "obs=768",
        "bpt=1",
    ]);
    assert_eq!(out.status.code(), Some(1));
    assert!(!dst.exists());
}

#[test]
fn test_partial_tail_records() {
    let (_dir, src, dst) = scratch_dir();
    let data = patterned(1000);
    write_file(&src, &data);
    let out = run_ptdd(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=512",
    ]);
    assert_eq!(out.status.code(), Some(0), "stderr: {}", stderr_of(&out));
    assert_eq!(fs::read(&dst).unwrap(), data);
    let err = stderr_of(&out);
    assert!(err.contains("1+1 records in"), "stderr: {}", err);
    assert!(err.contains("1+1 records out"), "stderr: {}", err);
}

fn sparse_src() -> Vec<u8> {
    // 8 zero blocks, one 'A' block, 9 zero blocks
    let mut data = vec![0u8; 512 * 18];
    data[4096..4608].fill(b'A');
    data
}

#[test]
fn test_sparse_skips_zero_blocks() {
    let (_dir, src, dst) = scratch_dir();
    let data = sparse_src();
    write_file(&src, &data);
    let out = run_ptdd(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=512",
        "bpt=8",
        "oflag=sparse",
    ]);
    assert_eq!(out.status.code(), Some(0), "stderr: {}", stderr_of(&out));
    // tail is materialised so the length is right
    assert_eq!(fs::metadata(&dst).unwrap().len(), 512 * 18);
    assert_eq!(fs::read(&dst).unwrap(), data);
    let err = stderr_of(&out);
    assert!(err.contains("bypassed records out"), "stderr: {}", err);
}

#[test]
fn test_sparse_hole_mode_leaves_tail_unmaterialised() {
    let (_dir, src, dst) = scratch_dir();
    let data = sparse_src();
    write_file(&src, &data);
    // sparse given twice asks for holes at the tail as well
    let out = run_ptdd(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=512",
        "bpt=8",
        "oflag=sparse",
        "conv=sparse",
    ]);
    assert_eq!(out.status.code(), Some(0), "stderr: {}", stderr_of(&out));
    // last written block is block 15; the zero tail is left unwritten
    assert_eq!(fs::metadata(&dst).unwrap().len(), 512 * 16);
    let got = fs::read(&dst).unwrap();
    assert_eq!(&got[..], &data[..512 * 16]);
}

#[test]
fn test_sparse_strunc_truncates_to_length() {
    let (_dir, src, dst) = scratch_dir();
    let data = sparse_src();
    write_file(&src, &data);
    let out = run_ptdd(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=512",
        "bpt=8",
        "oflag=sparse,strunc",
    ]);
    assert_eq!(out.status.code(), Some(0), "stderr: {}", stderr_of(&out));
    assert_eq!(fs::metadata(&dst).unwrap().len(), 512 * 18);
    assert_eq!(fs::read(&dst).unwrap(), data);
}

#[test]
fn test_sparse_copy_is_idempotent() {
    let (_dir, src, dst) = scratch_dir();
    let data = sparse_src();
    write_file(&src, &data);
    let args = [
        format!("if={}", src.display()),
        format!("of={}", dst.display()),
        "bs=512".to_string(),
        "bpt=8".to_string(),
        "oflag=sparse".to_string(),
    ];
    let argrefs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
    let out1 = run_ptdd(&argrefs);
    assert_eq!(out1.status.code(), Some(0));
    let first = fs::read(&dst).unwrap();
    let out2 = run_ptdd(&argrefs);
    assert_eq!(out2.status.code(), Some(0));
    let second = fs::read(&dst).unwrap();
    assert_eq!(first, second);
    assert_eq!(second.len(), 512 * 18);
}

#[test]
fn test_sparing_bypasses_identical_output() {
    let (_dir, src, dst) = scratch_dir();
    let data = patterned(512 * 16);
    write_file(&src, &data);
    write_file(&dst, &data);
    let out = run_ptdd(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=512",
        "oflag=sparing",
    ]);
    assert_eq!(out.status.code(), Some(0), "stderr: {}", stderr_of(&out));
    assert_eq!(fs::read(&dst).unwrap(), data);
    let err = stderr_of(&out);
    assert!(err.contains("16 bypassed records out"), "stderr: {}", err);
}

#[test]
fn test_sparing_writes_differences() {
    let (_dir, src, dst) = scratch_dir();
    let data = patterned(512 * 16);
    write_file(&src, &data);
    let mut old = data.clone();
    old[512 * 5..512 * 6].fill(0xee);
    write_file(&dst, &old);
    let out = run_ptdd(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=512",
        "bpt=4",
        "oflag=sparing",
    ]);
    assert_eq!(out.status.code(), Some(0), "stderr: {}", stderr_of(&out));
    assert_eq!(fs::read(&dst).unwrap(), data);
}

#[test]
fn test_sparing_fine_grained_chunks() {
    let (_dir, src, dst) = scratch_dir();
    let data = patterned(512 * 16);
    write_file(&src, &data);
    let mut old = data.clone();
    old[512 * 9..512 * 10].fill(0xee);
    write_file(&dst, &old);
    // bpt=8 with OBPC=1 compares block by block inside the transfer
    let out = run_ptdd(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=512",
        "bpt=8,1",
        "oflag=sparing",
    ]);
    assert_eq!(out.status.code(), Some(0), "stderr: {}", stderr_of(&out));
    assert_eq!(fs::read(&dst).unwrap(), data);
    let err = stderr_of(&out);
    assert!(err.contains("bypassed records out"), "stderr: {}", err);
}

#[test]
fn test_resume_continues_previous_copy() {
    let (_dir, src, dst) = scratch_dir();
    let data = patterned(512 * 100);
    write_file(&src, &data);
    write_file(&dst, &data[..512 * 40]);
    let out = run_ptdd(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=512",
        "bpt=4",
        "count=100",
        "oflag=resume",
    ]);
    assert_eq!(out.status.code(), Some(0), "stderr: {}", stderr_of(&out));
    let err = stderr_of(&out);
    assert!(err.contains("resume adjusting skip=40, seek=40, and count=60"),
        "stderr: {}", err);
    assert_eq!(fs::read(&dst).unwrap(), data);
}

#[test]
fn test_resume_after_complete_copy_is_a_no_op() {
    let (_dir, src, dst) = scratch_dir();
    let data = patterned(512 * 20);
    write_file(&src, &data);
    let out = run_ptdd(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=512",
    ]);
    assert_eq!(out.status.code(), Some(0));
    let out = run_ptdd(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=512",
        "oflag=resume",
    ]);
    assert_eq!(out.status.code(), Some(0), "stderr: {}", stderr_of(&out));
    assert!(stderr_of(&out).contains("resume finds copy complete, exiting"));
    assert_eq!(fs::read(&dst).unwrap(), data);
}

#[test]
fn test_of2_mirrors_writes() {
    let (dir, src, dst) = scratch_dir();
    let data = patterned(512 * 12);
    write_file(&src, &data);
    let dst2 = dir.path().join("dst2.bin");
    let out = run_ptdd(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        &format!("of2={}", dst2.display()),
        "bs=512",
    ]);
    assert_eq!(out.status.code(), Some(0), "stderr: {}", stderr_of(&out));
    assert_eq!(fs::read(&dst).unwrap(), data);
    assert_eq!(fs::read(&dst2).unwrap(), data);
}

#[test]
fn test_trunc_shrinks_existing_output() {
    let (_dir, src, dst) = scratch_dir();
    let data = patterned(512 * 4);
    write_file(&src, &data);
    write_file(&dst, &vec![0xffu8; 512 * 10]);
    let out = run_ptdd(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=512",
        "oflag=trunc",
    ]);
    assert_eq!(out.status.code(), Some(0), "stderr: {}", stderr_of(&out));
    assert_eq!(fs::read(&dst).unwrap(), data);
}

#[test]
fn test_no_truncation_by_default() {
    let (_dir, src, dst) = scratch_dir();
    let data = patterned(512 * 4);
    write_file(&src, &data);
    write_file(&dst, &vec![0xffu8; 512 * 10]);
    let out = run_ptdd(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=512",
    ]);
    assert_eq!(out.status.code(), Some(0));
    let got = fs::read(&dst).unwrap();
    assert_eq!(got.len(), 512 * 10);
    assert_eq!(&got[..512 * 4], &data[..]);
    assert!(got[512 * 4..].iter().all(|&b| b == 0xff));
}

#[test]
fn test_append_extends_output() {
    let (_dir, src, dst) = scratch_dir();
    let data = patterned(512 * 4);
    write_file(&src, &data);
    let old = vec![0x11u8; 512 * 2];
    write_file(&dst, &old);
    let out = run_ptdd(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=512",
        "oflag=append",
    ]);
    assert_eq!(out.status.code(), Some(0), "stderr: {}", stderr_of(&out));
    let got = fs::read(&dst).unwrap();
    assert_eq!(got.len(), 512 * 6);
    assert_eq!(&got[..1024], &old[..]);
    assert_eq!(&got[1024..], &data[..]);
}

#[test]
fn test_nowrite_touches_nothing() {
    let (_dir, src, dst) = scratch_dir();
    let data = patterned(512 * 4);
    write_file(&src, &data);
    let old = vec![0x22u8; 512 * 4];
    write_file(&dst, &old);
    let out = run_ptdd(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=512",
        "oflag=nowrite",
    ]);
    assert_eq!(out.status.code(), Some(0), "stderr: {}", stderr_of(&out));
    assert_eq!(fs::read(&dst).unwrap(), old);
    assert!(stderr_of(&out).contains("0+0 records out"));
}

#[test]
fn test_stdin_to_stdout() {
    let data = patterned(512 * 6);
    let out = run_ptdd_stdin(&["if=-", "of=-", "bs=512"], &data);
    assert_eq!(out.status.code(), Some(0), "stderr: {}", stderr_of(&out));
    assert_eq!(out.stdout, data);
}

#[test]
fn test_stdin_to_file() {
    let (_dir, _src, dst) = scratch_dir();
    let data = patterned(512 * 6 + 100);
    let out = run_ptdd_stdin(
        &["if=-", &format!("of={}", dst.display()), "bs=512"],
        &data,
    );
    assert_eq!(out.status.code(), Some(0), "stderr: {}", stderr_of(&out));
    assert_eq!(fs::read(&dst).unwrap(), data);
}

#[test]
fn test_null_sink_reads_only() {
    let (_dir, src, _dst) = scratch_dir();
    write_file(&src, &patterned(512 * 10));
    let out = run_ptdd(&[&format!("if={}", src.display()), "bs=512"]);
    assert_eq!(out.status.code(), Some(0), "stderr: {}", stderr_of(&out));
    let err = stderr_of(&out);
    assert!(err.contains("Output file not specified so no copy, just reading input"));
    assert!(err.contains("10+0 records in"), "stderr: {}", err);
    assert!(err.contains("0+0 records out"), "stderr: {}", err);
}

#[test]
fn test_fdatasync_conv() {
    let (_dir, src, dst) = scratch_dir();
    let data = patterned(512 * 4);
    write_file(&src, &data);
    let out = run_ptdd(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=512",
        "conv=fdatasync",
    ]);
    assert_eq!(out.status.code(), Some(0), "stderr: {}", stderr_of(&out));
    assert_eq!(fs::read(&dst).unwrap(), data);
}

#[test]
fn test_missing_if_is_a_syntax_error() {
    let out = run_ptdd(&["bs=512"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr_of(&out).contains("'if=IFILE' option must be given"));
}

#[test]
fn test_unknown_option_is_a_syntax_error() {
    let out = run_ptdd(&["frobnicate=1"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr_of(&out).contains("Unrecognized option"));
}

#[test]
fn test_missing_input_file_is_a_file_error() {
    let (_dir, _src, dst) = scratch_dir();
    let out = run_ptdd(&["if=/no/such/input", &format!("of={}", dst.display())]);
    assert_eq!(out.status.code(), Some(2));
    assert!(stderr_of(&out).contains("unable to access"));
}

#[test]
fn test_help_and_version() {
    let out = run_ptdd(&["--help"]);
    assert_eq!(out.status.code(), Some(0));
    assert!(stderr_of(&out).contains("Usage: ptdd"));
    let out = run_ptdd(&["--version"]);
    assert_eq!(out.status.code(), Some(0));
    assert!(stderr_of(&out).contains("ptdd version"));
}

#[test]
fn test_status_noxfer_suppresses_throughput() {
    let (_dir, src, dst) = scratch_dir();
    write_file(&src, &patterned(512 * 4));
    let out = run_ptdd(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=512",
        "status=noxfer",
    ]);
    assert_eq!(out.status.code(), Some(0));
    assert!(!stderr_of(&out).contains("time to transfer"));
}

#[test]
fn test_verbose_reports_file_types() {
    let (_dir, src, dst) = scratch_dir();
    write_file(&src, &patterned(512 * 2));
    let out = run_ptdd(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=512",
        "verbose=1",
    ]);
    assert_eq!(out.status.code(), Some(0));
    let err = stderr_of(&out);
    assert!(err.contains("Input file type: regular file"), "stderr: {}", err);
    assert!(err.contains("skip=0 (blocks on input), seek=0 (blocks on output)"));
}

#[test]
fn test_bs_with_suffix() {
    let (_dir, src, dst) = scratch_dir();
    let data = patterned(4 * 1024);
    write_file(&src, &data);
    let out = run_ptdd(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=1k",
        "count=4",
    ]);
    assert_eq!(out.status.code(), Some(0));
    assert_eq!(fs::read(&dst).unwrap(), data);
}
