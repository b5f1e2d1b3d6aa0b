//! E2E suite: the `zbd-img` binary as a black box.

use std::path::PathBuf;
use std::process::Command;
use tempfile::TempDir;

/// Locate the `zbd-img` binary produced by Cargo.
fn zbd_img_bin() -> PathBuf {
    if let Ok(p) = std::env::var("CARGO_BIN_EXE_zbd-img") {
        return PathBuf::from(p);
    }
    let mut p = std::env::current_exe().unwrap();
    p.pop(); // remove test binary filename
    if p.ends_with("deps") {
        p.pop();
    }
    p.push("zbd-img");
    p
}

#[test]
fn create_info_probe_roundtrip() {
    let dir = TempDir::new().unwrap();
    let img = dir.path().join("disk.zbd");

    let status = Command::new(zbd_img_bin())
        .args(["create", "-s", "64M", img.to_str().unwrap()])
        .status()
        .expect("failed to run zbd-img create");
    assert!(status.success(), "create should exit 0");
    assert!(img.exists());

    let out = Command::new(zbd_img_bin())
        .args(["info", img.to_str().unwrap()])
        .output()
        .expect("failed to run zbd-img info");
    assert!(out.status.success(), "info should exit 0");
    let text = String::from_utf8_lossy(&out.stdout);
    assert!(text.contains("capacity:"), "info output: {}", text);
    assert!(text.contains(&(64u64 << 20).to_string()));

    let status = Command::new(zbd_img_bin())
        .args(["probe", img.to_str().unwrap()])
        .status()
        .expect("failed to run zbd-img probe");
    assert!(status.success(), "probe of an image should exit 0");
}

#[test]
fn create_with_suffixed_options() {
    let dir = TempDir::new().unwrap();
    let img = dir.path().join("disk.zbd");

    let status = Command::new(zbd_img_bin())
        .args([
            "create",
            "-s",
            "32MiB",
            "-c",
            "8K",
            "-z",
            "2M",
            "--init",
            "trim",
            img.to_str().unwrap(),
        ])
        .status()
        .unwrap();
    assert!(status.success());

    let out = Command::new(zbd_img_bin())
        .args(["info", img.to_str().unwrap()])
        .output()
        .unwrap();
    let text = String::from_utf8_lossy(&out.stdout);
    assert!(text.contains("8192"), "cluster size missing: {}", text);
    assert!(text.contains("Trim"), "init policy missing: {}", text);
}

#[test]
fn create_rejects_bad_parameters() {
    let dir = TempDir::new().unwrap();
    let img = dir.path().join("disk.zbd");

    // Size not a multiple of the cluster size.
    let out = Command::new(zbd_img_bin())
        .args(["create", "-s", "100000", img.to_str().unwrap()])
        .output()
        .unwrap();
    assert!(!out.status.success());

    // Unparseable size.
    let out = Command::new(zbd_img_bin())
        .args(["create", "-s", "lots", img.to_str().unwrap()])
        .output()
        .unwrap();
    assert!(!out.status.success());

    // Cluster size not a power of two.
    let out = Command::new(zbd_img_bin())
        .args(["create", "-s", "64M", "-c", "5000", img.to_str().unwrap()])
        .output()
        .unwrap();
    assert!(!out.status.success());
}

#[test]
fn probe_rejects_non_image() {
    let dir = TempDir::new().unwrap();
    let junk = dir.path().join("junk.bin");
    std::fs::write(&junk, b"this is not an image file at all").unwrap();

    let status = Command::new(zbd_img_bin())
        .args(["probe", junk.to_str().unwrap()])
        .status()
        .unwrap();
    assert!(!status.success(), "probe of junk should exit non-zero");
}

#[test]
fn info_rejects_missing_file() {
    let out = Command::new(zbd_img_bin())
        .args(["info", "/nonexistent/path/disk.zbd"])
        .output()
        .unwrap();
    assert!(!out.status.success());
    let err = String::from_utf8_lossy(&out.stderr);
    assert!(err.contains("zbd-img:"), "stderr: {}", err);
}
