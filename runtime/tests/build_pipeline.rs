//! Integration tests: whole builds through the public pipeline API.
//!
//! Every image is assembled on disk by the test itself, so none of these
//! need network access. Builds that need root, a registry or host package
//! tools are `#[ignore]`:
//!
//! ```bash
//! cargo test -p sbuild-runtime --test build_pipeline -- --ignored --nocapture
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use sbuild_core::platform::Platform;
use sbuild_core::recipe::Recipe;
use sbuild_runtime::cache::sha256_bytes;
use sbuild_runtime::sources::SourceKind;
use sbuild_runtime::{build, BuildOptions, OCI_CONFIG_JSON};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

enum Entry<'a> {
    File(&'a str, &'a [u8]),
    Dir(&'a str),
    Symlink(&'a str, &'a str),
}

fn layer_tar(entries: &[Entry<'_>]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for entry in entries {
        let mut header = tar::Header::new_gnu();
        match entry {
            Entry::File(path, data) => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(0o644);
                header.set_size(data.len() as u64);
                header.set_cksum();
                builder.append_data(&mut header, path, *data).unwrap();
            }
            Entry::Dir(path) => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                header.set_cksum();
                builder.append_data(&mut header, path, std::io::empty()).unwrap();
            }
            Entry::Symlink(path, target) => {
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_mode(0o777);
                header.set_size(0);
                builder.append_link(&mut header, path, target).unwrap();
            }
        }
    }
    builder.into_inner().unwrap()
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

fn image_config() -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "architecture": "amd64",
        "os": "linux",
        "config": {
            "Entrypoint": ["/bin/app"],
            "Cmd": ["--serve"],
            "Env": ["PATH=/usr/local/bin:/usr/bin:/bin", "APP_MODE=test"],
            "WorkingDir": "/srv",
            "Labels": {"org.example.team": "build"}
        },
        "rootfs": {"type": "layers", "diff_ids": []}
    }))
    .unwrap()
}

fn write_blob(layout: &Path, data: &[u8]) -> String {
    let digest = sha256_bytes(data);
    let dir = layout.join("blobs/sha256");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(digest.trim_start_matches("sha256:")), data).unwrap();
    digest
}

/// Two layers: a base and one that whiteouts part of it.
fn layers() -> Vec<Vec<u8>> {
    let base = layer_tar(&[
        Entry::Dir("bin"),
        Entry::File("bin/app", b"#!/bin/sh\necho app\n"),
        Entry::Dir("etc"),
        Entry::File("etc/obsolete.conf", b"old"),
        Entry::Dir("var/cache"),
        Entry::File("var/cache/a", b"a"),
        Entry::File("var/cache/b", b"b"),
        Entry::Symlink("bin/app-link", "app"),
    ]);
    let top = layer_tar(&[
        Entry::File("etc/.wh.obsolete.conf", b""),
        Entry::File("var/cache/.wh..wh..opq", b""),
        Entry::File("var/cache/fresh", b"fresh"),
        Entry::File("etc/app.conf", b"mode=test\n"),
    ]);
    vec![base, top]
}

fn write_oci_layout(layout: &Path, tag: &str) {
    let config = image_config();
    let config_digest = write_blob(layout, &config);
    let layer_descs: Vec<_> = layers()
        .iter()
        .map(|tar| {
            let blob = gzip(tar);
            serde_json::json!({
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": write_blob(layout, &blob),
                "size": blob.len()
            })
        })
        .collect();
    let manifest = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": config_digest,
            "size": config.len()
        },
        "layers": layer_descs
    }))
    .unwrap();
    let manifest_digest = write_blob(layout, &manifest);
    fs::write(layout.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();
    fs::write(
        layout.join("index.json"),
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": manifest_digest,
                "size": manifest.len(),
                "annotations": {"org.opencontainers.image.ref.name": tag}
            }]
        }))
        .unwrap(),
    )
    .unwrap();
}

fn tar_dir(src: &Path, dest: &Path) {
    let mut builder = tar::Builder::new(fs::File::create(dest).unwrap());
    builder.append_dir_all(".", src).unwrap();
    builder.finish().unwrap();
}

fn options(dir: &TempDir) -> BuildOptions {
    BuildOptions::default()
        .with_tmp_dir(dir.path().join("scratch"))
        .with_platform(Platform::new("linux", "amd64", None))
}

fn assert_image_rootfs(rootfs: &Path) {
    assert_eq!(
        fs::read(rootfs.join("bin/app")).unwrap(),
        b"#!/bin/sh\necho app\n"
    );
    assert_eq!(
        fs::read_link(rootfs.join("bin/app-link")).unwrap(),
        PathBuf::from("app")
    );
    assert_eq!(fs::read(rootfs.join("etc/app.conf")).unwrap(), b"mode=test\n");
    assert!(!rootfs.join("etc/obsolete.conf").exists());
    assert!(!rootfs.join("var/cache/a").exists());
    assert!(!rootfs.join("var/cache/b").exists());
    assert_eq!(fs::read(rootfs.join("var/cache/fresh")).unwrap(), b"fresh");

    let runscript = fs::read_to_string(rootfs.join(".singularity.d/runscript")).unwrap();
    assert!(runscript.contains("OCI_ENTRYPOINT='\"/bin/app\"'"));
    assert!(runscript.contains("OCI_CMD='\"--serve\"'"));
    let env = fs::read_to_string(rootfs.join(".singularity.d/env/10-docker2singularity.sh"))
        .unwrap();
    assert!(env.contains("APP_MODE"));
    let labels = fs::read_to_string(rootfs.join(".singularity.d/labels.json")).unwrap();
    assert!(labels.contains("org.example.team"));
    for action in ["exec", "run", "shell", "start", "test"] {
        assert!(rootfs.join(".singularity.d/actions").join(action).exists());
    }
}

#[tokio::test]
async fn test_scratch_build() {
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("scratch.sandbox");
    let output = build(
        Recipe::new("scratch"),
        options(&dir),
        &dest,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(output.source, SourceKind::Scratch);
    for path in ["proc", "sys", "dev", "tmp", "etc/hosts", "environment", "singularity"] {
        assert!(
            fs::symlink_metadata(dest.join(path)).is_ok(),
            "{} missing",
            path
        );
    }
    assert!(output.json_objects.is_empty());
}

#[tokio::test]
async fn test_oci_layout_build() {
    let dir = TempDir::new().unwrap();
    let layout = dir.path().join("layout");
    write_oci_layout(&layout, "1.0");

    let recipe = Recipe::new("oci").with_header("from", format!("{}:1.0", layout.display()));
    let dest = dir.path().join("oci.sandbox");
    let output = build(recipe, options(&dir), &dest, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(output.source, SourceKind::Oci);
    assert_image_rootfs(&dest);
    let config: serde_json::Value =
        serde_json::from_slice(&output.json_objects[OCI_CONFIG_JSON]).unwrap();
    assert_eq!(config["config"]["WorkingDir"], "/srv");
}

#[tokio::test]
async fn test_oci_layout_unknown_tag() {
    let dir = TempDir::new().unwrap();
    let layout = dir.path().join("layout");
    write_oci_layout(&layout, "1.0");

    let recipe = Recipe::new("oci").with_header("from", format!("{}:2.0", layout.display()));
    let dest = dir.path().join("oci.sandbox");
    build(recipe, options(&dir), &dest, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_oci_archive_build() {
    let dir = TempDir::new().unwrap();
    let layout = dir.path().join("layout");
    write_oci_layout(&layout, "latest");
    let archive = dir.path().join("image.oci.tar");
    tar_dir(&layout, &archive);

    let recipe = Recipe::from_uri(&format!("oci-archive:{}", archive.display())).unwrap();
    let dest = dir.path().join("archive.sandbox");
    build(recipe, options(&dir), &dest, &CancellationToken::new())
        .await
        .unwrap();
    assert_image_rootfs(&dest);
}

#[tokio::test]
async fn test_oci_platform_mismatch() {
    let dir = TempDir::new().unwrap();
    let layout = dir.path().join("layout");
    write_oci_layout(&layout, "latest");

    let recipe = Recipe::new("oci").with_header("from", layout.display().to_string());
    let opts = options(&dir).with_platform(Platform::new("linux", "arm64", None));
    let err = build(recipe, opts, &dir.path().join("out"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "platform_mismatch");
}

#[tokio::test]
async fn test_docker_archive_build() {
    let dir = TempDir::new().unwrap();
    let saved = dir.path().join("saved");
    fs::create_dir_all(&saved).unwrap();
    fs::write(saved.join("config.json"), image_config()).unwrap();
    let mut layer_names = Vec::new();
    for (i, layer) in layers().iter().enumerate() {
        let name = format!("layer{}/layer.tar", i);
        fs::create_dir_all(saved.join(format!("layer{}", i))).unwrap();
        fs::write(saved.join(&name), layer).unwrap();
        layer_names.push(name);
    }
    fs::write(
        saved.join("manifest.json"),
        serde_json::to_vec(&serde_json::json!([{
            "Config": "config.json",
            "RepoTags": ["example/app:1.0"],
            "Layers": layer_names
        }]))
        .unwrap(),
    )
    .unwrap();
    let archive = dir.path().join("app.docker.tar");
    tar_dir(&saved, &archive);

    let recipe = Recipe::new("docker-archive").with_header("from", archive.display().to_string());
    let dest = dir.path().join("docker.sandbox");
    let output = build(recipe, options(&dir), &dest, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(output.source, SourceKind::Oci);
    assert_image_rootfs(&dest);
}

#[tokio::test]
async fn test_sandbox_localimage_build() {
    let dir = TempDir::new().unwrap();
    let first = dir.path().join("first.sandbox");
    build(
        Recipe::new("scratch"),
        options(&dir),
        &first,
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    fs::create_dir_all(first.join("opt/tool")).unwrap();
    fs::write(first.join("opt/tool/VERSION"), b"2\n").unwrap();

    let recipe = Recipe::new("localimage").with_header("from", first.display().to_string());
    let second = dir.path().join("second.sandbox");
    let output = build(recipe, options(&dir), &second, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(output.source, SourceKind::Local);
    assert_eq!(fs::read(second.join("opt/tool/VERSION")).unwrap(), b"2\n");
    assert!(second.join(".singularity.d/actions/run").exists());
}

#[tokio::test]
async fn test_cancelled_build() {
    let dir = TempDir::new().unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    // sandbox localimage extraction is synchronous, so cancel a source that
    // runs a host tool instead
    let recipe = Recipe::new("docker-daemon").with_header("from", "example/app:1.0");
    let err = build(recipe, options(&dir), &dir.path().join("out"), &cancel)
        .await
        .unwrap_err();
    assert!(
        matches!(err.kind(), "cancelled" | "tool_missing"),
        "unexpected error: {err}"
    );
}

#[tokio::test]
#[ignore = "requires network access"]
async fn test_docker_hub_build() {
    let dir = TempDir::new().unwrap();
    let recipe = Recipe::from_uri("docker://alpine:3.19").unwrap();
    let dest = dir.path().join("alpine.sandbox");
    build(recipe, options(&dir), &dest, &CancellationToken::new())
        .await
        .unwrap();
    assert!(dest.join("etc/alpine-release").exists());
}

#[tokio::test]
#[ignore = "requires root and debootstrap"]
async fn test_debootstrap_build() {
    let dir = TempDir::new().unwrap();
    let recipe = Recipe::new("debootstrap")
        .with_header("osversion", "bookworm")
        .with_header("mirrorurl", "http://deb.debian.org/debian/");
    let dest = dir.path().join("debian.sandbox");
    build(recipe, options(&dir), &dest, &CancellationToken::new())
        .await
        .unwrap();
    assert!(dest.join("etc/debian_version").exists());
}
