mod common;

use anyhow::Result;
use common::{Fault, MemoryHost, Target};
use shellcp::error::{ChannelError, ProbeError};
use shellcp::{Client, ClientConfig, Error};
use std::io::{Cursor, Read};
use std::time::Duration;
use tempfile::TempDir;

const VERSION_PROBE: &str = "printf '<Objects>";
const CONFIG_PROBE: &str = "printf '<Config>";

/// Host that answers the probe with a 16 KiB envelope (6144-byte chunks).
fn probed_host() -> MemoryHost {
    MemoryHost::new()
        .respond(VERSION_PROBE, "<Objects><Object>Linux 6.1.0</Object></Objects>")
        .envelope_kb(16)
}

fn config() -> ClientConfig {
    let mut cfg = ClientConfig::default();
    cfg.retry.base_delay_ms = 0;
    cfg.retry.max_delay_ms = 0;
    cfg
}

fn bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn copies_a_single_file() -> Result<()> {
    let tmp = TempDir::new()?;
    let local = tmp.path().join("payload.bin");
    std::fs::write(&local, bytes(20_000))?;

    let host = probed_host();
    let client = Client::new(host.clone(), config());
    assert_eq!(client.chunk_size().await?, 6144);

    let stats = client.copy(&local, "/srv/drop/payload.bin").await?;
    assert_eq!(stats.files, 1);
    assert_eq!(stats.bytes, 20_000);
    assert_eq!(stats.chunks, 4);
    assert_eq!(host.file("/srv/drop/payload.bin").unwrap(), bytes(20_000));
    assert!(host.staging_files().is_empty());
    assert_eq!(host.open_shells(), 0);
    Ok(())
}

#[tokio::test]
async fn directory_is_sent_as_one_archive() -> Result<()> {
    let tmp = TempDir::new()?;
    let root = tmp.path().join("site");
    std::fs::create_dir_all(root.join("css"))?;
    std::fs::write(root.join("index.html"), b"<h1>hi</h1>")?;
    std::fs::write(root.join("css/app.css"), bytes(9_000))?;

    let host = probed_host();
    let client = Client::new(host.clone(), config());
    let stats = client.copy(&root, "/deploy/site.zip").await?;
    assert_eq!(stats.files, 1);

    let zip_bytes = host.file("/deploy/site.zip").expect("archive delivered");
    let mut zip = zip::ZipArchive::new(Cursor::new(zip_bytes))?;
    let mut names: Vec<String> = (0..zip.len())
        .map(|i| zip.by_index(i).map(|f| f.name().to_string()))
        .collect::<Result<_, _>>()?;
    names.sort();
    assert_eq!(names, vec!["site/", "site/css/", "site/css/app.css", "site/index.html"]);

    let mut css = Vec::new();
    zip.by_name("site/css/app.css")?.read_to_end(&mut css)?;
    assert_eq!(css, bytes(9_000));
    Ok(())
}

#[tokio::test]
async fn direct_mode_mirrors_files_and_skips_finder_metadata() -> Result<()> {
    let tmp = TempDir::new()?;
    let root = tmp.path().join("tree");
    std::fs::create_dir_all(root.join("a/b"))?;
    std::fs::write(root.join("top.txt"), b"top")?;
    std::fs::write(root.join("a/one.bin"), bytes(7_000))?;
    std::fs::write(root.join("a/b/empty"), b"")?;
    std::fs::write(root.join(".DS_Store"), b"junk")?;
    std::fs::write(root.join("a/.DS_Store"), b"junk")?;

    let host = probed_host();
    let mut cfg = config();
    cfg.archive_directories = false;
    let client = Client::new(host.clone(), cfg);

    let stats = client.copy(&root, "/mirror").await?;
    assert_eq!(stats.files, 3);
    assert_eq!(stats.bytes, 7_003);

    let files = host.files();
    let names: Vec<&str> = files.keys().map(String::as_str).collect();
    assert_eq!(names, vec!["/mirror/a/b/empty", "/mirror/a/one.bin", "/mirror/top.txt"]);
    assert_eq!(files["/mirror/a/one.bin"], bytes(7_000));
    assert!(files["/mirror/a/b/empty"].is_empty());
    Ok(())
}

#[tokio::test]
async fn direct_mode_respects_host_shell_limit() -> Result<()> {
    let tmp = TempDir::new()?;
    for i in 0..10 {
        std::fs::write(tmp.path().join(format!("f{i}.dat")), bytes(100 + i))?;
    }

    let host = MemoryHost::new()
        .respond(VERSION_PROBE, "<Objects><Object>Linux 6.1.0</Object></Objects>")
        .respond(
            CONFIG_PROBE,
            "<Config><MaxEnvelopeSizekb>16</MaxEnvelopeSizekb>\
             <Winrs><MaxShellsPerUser>2</MaxShellsPerUser></Winrs></Config>",
        )
        .delays(vec![Duration::from_millis(15)]);
    let mut cfg = config();
    cfg.archive_directories = false;
    let client = Client::new(host.clone(), cfg);

    assert_eq!(client.capabilities().await?.parallelism(4), 2);
    let stats = client.copy(tmp.path(), "/many").await?;
    assert_eq!(stats.files, 10);
    assert_eq!(host.peak_shells(), 2);
    assert_eq!(host.files().len(), 10);
    Ok(())
}

#[tokio::test]
async fn probe_runs_once_per_session() -> Result<()> {
    let tmp = TempDir::new()?;
    let local = tmp.path().join("x");
    std::fs::write(&local, b"x")?;

    let host = probed_host();
    let client = Client::new(host.clone(), config());
    client.copy(&local, "/a/x").await?;
    client.copy(&local, "/b/x").await?;
    client.write("/c/x", &b"streamed"[..]).await?;

    let probes = host
        .commands()
        .iter()
        .filter(|c| c.starts_with(CONFIG_PROBE))
        .count();
    assert_eq!(probes, 1);
    assert_eq!(host.file("/c/x").unwrap(), b"streamed");
    Ok(())
}

#[tokio::test]
async fn empty_version_output_leaves_version_blank() -> Result<()> {
    let host = MemoryHost::new().respond(VERSION_PROBE, "").envelope_kb(64);
    let client = Client::new(host, config());

    let snapshot = client.capabilities().await?;
    assert_eq!(snapshot.powershell.version, "");
    assert_eq!(snapshot.powershell.execution_policy, "");
    assert_eq!(snapshot.envelope_bytes(), 64 * 1024);
    Ok(())
}

#[tokio::test]
async fn malformed_probe_falls_back_unless_strict() -> Result<()> {
    let broken = || {
        MemoryHost::new()
            .respond(VERSION_PROBE, "<Objects><Object>Linux 6.1.0</Object></Objects>")
            .respond(CONFIG_PROBE, "WSManFault: access denied")
    };

    let lenient = Client::new(broken(), config());
    assert_eq!(lenient.capabilities().await?.envelope_bytes(), 0);
    // posix default envelope: (128 KiB - 8 KiB) * 3 / 4
    assert_eq!(lenient.chunk_size().await?, 92_160);

    let mut cfg = config();
    cfg.strict_probe = true;
    let strict = Client::new(broken(), cfg);
    let err = strict.capabilities().await.unwrap_err();
    assert!(matches!(err, Error::Probe(ProbeError::Parse { .. })), "{err:?}");
    Ok(())
}

#[tokio::test]
async fn envelope_cap_from_config_wins() -> Result<()> {
    let mut cfg = config();
    cfg.max_envelope_bytes = Some(12 * 1024);
    let client = Client::new(probed_host(), cfg);
    // (12 KiB - 8 KiB) * 3 / 4
    assert_eq!(client.chunk_size().await?, 3072);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_is_fatal() -> Result<()> {
    let tmp = TempDir::new()?;
    let local = tmp.path().join("x");
    std::fs::write(&local, b"x")?;

    let host = MemoryHost::new().stall_connect();
    let mut cfg = config();
    cfg.connect_timeout_ms = 500;
    let client = Client::new(host.clone(), cfg);

    let err = client.copy(&local, "/x").await.unwrap_err();
    match err {
        Error::Probe(ProbeError::Channel { source, .. }) => {
            assert!(matches!(source, ChannelError::ConnectTimeout(_)));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(host.commands().is_empty());
    Ok(())
}

#[tokio::test]
async fn refused_connection_is_fatal_even_when_lenient() -> Result<()> {
    let client = Client::new(MemoryHost::new().refuse_connect(), config());
    let err = client.capabilities().await.unwrap_err();
    assert!(matches!(err, Error::Probe(ref e) if e.is_connection()), "{err:?}");
    Ok(())
}

#[tokio::test]
async fn transfer_failure_aborts_copy_without_destination() -> Result<()> {
    let tmp = TempDir::new()?;
    let local = tmp.path().join("x");
    std::fs::write(&local, bytes(10_000))?;

    let host = probed_host().fail(Target::Append, Fault::Transient, 5);
    let client = Client::new(host.clone(), config());
    let err = client.copy(&local, "/srv/x").await.unwrap_err();

    assert!(matches!(err, Error::Transfer(ref t) if t.is_retryable()), "{err:?}");
    assert!(host.file("/srv/x").is_none());
    Ok(())
}

#[tokio::test]
async fn missing_local_source_is_reported() {
    let client = Client::new(probed_host(), config());
    let err = client
        .copy(std::path::Path::new("/definitely/not/here"), "/x")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Local { op: "stat", .. }), "{err:?}");
}

#[tokio::test]
async fn lists_remote_directory() -> Result<()> {
    let host = probed_host();
    host.mkdir("/srv/www/assets");
    host.put("/srv/www/index.html", b"hello");
    let client = Client::new(host, config());

    let items = client.list("/srv/www").await?;
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].name, "assets");
    assert!(items[0].is_dir);
    assert_eq!(items[1].name, "index.html");
    assert_eq!(items[1].size, 5);
    assert_eq!(items[1].modified.timestamp(), 1_700_000_000);
    Ok(())
}

#[tokio::test]
async fn listing_missing_directory_fails() {
    let client = Client::new(probed_host(), config());
    let err = client.list("/nope").await.unwrap_err();
    assert!(matches!(err, Error::List { .. }), "{err:?}");
}
