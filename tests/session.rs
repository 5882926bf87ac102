//! End-to-end session tests.
//!
//! Each test wires the real client session to the real server session over
//! an in-memory duplex stream, so everything above the transport - framing,
//! authentication, dispatch, transfers, storage - runs exactly as it does
//! over TLS.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tokio::io::{duplex, DuplexStream};
use tokio::task::JoinHandle;

use filevault::auth::{AUTH_SUCCESSFUL, PASSWORD_PROMPT, USERNAME_PROMPT, VerifyCredentials};
use filevault::client::ClientSession;
use filevault::protocol::{Framing, ProtocolError, INVALID_ACTION, NO_FILES, READY};
use filevault::server::serve_session;
use filevault::storage::StorageResolver;

struct StaticCreds;

impl VerifyCredentials for StaticCreds {
    fn verify(&self, username: &str, password: &str) -> bool {
        matches!(
            (username, password),
            ("alice", "secret") | ("bob", "hunter2")
        )
    }
}

fn spawn_session(
    root: &Path,
) -> (
    ClientSession<DuplexStream>,
    JoinHandle<Result<(), ProtocolError>>,
) {
    let (client_side, server_side) = duplex(64 * 1024);
    let resolver = StorageResolver::new(root);
    let handle = tokio::spawn(async move {
        serve_session(server_side, "test-peer", &StaticCreds, &resolver).await
    });
    (ClientSession::new(client_side), handle)
}

fn patterned_bytes(len: usize) -> Vec<u8> {
    let mut data: Vec<u8> = (0..len).map(|i| ((i * 31 + 7) % 256) as u8).collect();
    // Plant sentinel lookalikes: command words, an "EOF" marker, and bytes
    // that spell an end-of-stream frame header.
    let plant = b"EOF quit ACK \x00\x00\x00\x01\x02";
    if len > plant.len() + 16 {
        data[16..16 + plant.len()].copy_from_slice(plant);
    }
    data
}

async fn write_local(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.join(name);
    tokio::fs::write(&path, contents).await.unwrap();
    path
}

#[tokio::test]
async fn upload_then_download_returns_exact_bytes() {
    let storage = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    let (mut session, server) = spawn_session(storage.path());

    session.authenticate("alice", "secret").await.unwrap();

    // 5000 bytes in 1024-byte chunks: four full chunks and one partial one,
    // each individually acknowledged.
    let contents = patterned_bytes(5000);
    let local_path = write_local(local.path(), "data.bin", &contents).await;

    let confirmation = session.upload(&local_path, "data.bin").await.unwrap();
    assert!(confirmation.contains("5000 bytes"));

    let fetched = local.path().join("fetched.bin");
    let received = session.download("data.bin", &fetched).await.unwrap();
    assert_eq!(received, 5000);
    assert_eq!(tokio::fs::read(&fetched).await.unwrap(), contents);

    session.quit().await.unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn uploaded_entry_lands_in_the_sharded_user_dir() {
    let storage = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    let (mut session, server) = spawn_session(storage.path());

    session.authenticate("alice", "secret").await.unwrap();
    let local_path = write_local(local.path(), "f.txt", b"hello").await;
    session.upload(&local_path, "f.txt").await.unwrap();
    session.quit().await.unwrap();
    server.await.unwrap().unwrap();

    let stored = storage.path().join("a").join("alice").join("f.txt");
    assert_eq!(tokio::fs::read(&stored).await.unwrap(), b"hello");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&stored).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

#[tokio::test]
async fn rejected_credentials_end_the_session() {
    let storage = TempDir::new().unwrap();
    let (mut session, server) = spawn_session(storage.path());

    let err = session.authenticate("alice", "wrong").await.unwrap_err();
    assert!(err.to_string().contains("Authentication Failed"));

    // The server is done; no command gets processed on this session.
    server.await.unwrap().unwrap();
    assert!(session.list().await.is_err());
}

#[tokio::test]
async fn repeated_upload_overwrites_last_writer_wins() {
    let storage = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    let (mut session, server) = spawn_session(storage.path());

    session.authenticate("alice", "secret").await.unwrap();

    let first = write_local(local.path(), "v1", b"first version, longer").await;
    let second = write_local(local.path(), "v2", b"second").await;
    session.upload(&first, "doc.txt").await.unwrap();
    session.upload(&second, "doc.txt").await.unwrap();

    let fetched = local.path().join("fetched");
    session.download("doc.txt", &fetched).await.unwrap();
    assert_eq!(tokio::fs::read(&fetched).await.unwrap(), b"second");

    session.quit().await.unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn delete_then_list_no_longer_shows_the_entry() {
    let storage = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    let (mut session, server) = spawn_session(storage.path());

    session.authenticate("alice", "secret").await.unwrap();

    let path = write_local(local.path(), "a.txt", b"a").await;
    session.upload(&path, "a.txt").await.unwrap();
    let path = write_local(local.path(), "b.txt", b"b").await;
    session.upload(&path, "b.txt").await.unwrap();

    assert_eq!(session.list().await.unwrap(), vec!["a.txt", "b.txt"]);

    let response = session.delete("a.txt").await.unwrap();
    assert!(response.contains("deleted successfully"));
    assert_eq!(session.list().await.unwrap(), vec!["b.txt"]);

    session.delete("b.txt").await.unwrap();
    assert!(session.list().await.unwrap().is_empty());

    // Downloading a deleted entry reports not-found, session keeps going.
    let fetched = local.path().join("gone");
    let err = session.download("a.txt", &fetched).await.unwrap_err();
    assert!(err.to_string().contains("File not found"));
    assert_eq!(session.delete("a.txt").await.unwrap(), "File not found");

    session.quit().await.unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn traversal_filenames_are_rejected_out_of_scope() {
    let storage = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    let (mut session, server) = spawn_session(storage.path());

    session.authenticate("alice", "secret").await.unwrap();

    let local_path = write_local(local.path(), "evil.bin", b"payload").await;
    for name in ["../evil.bin", "../../etc/passwd", "sub/evil.bin", "..", ".hidden"] {
        let err = session.upload(&local_path, name).await.unwrap_err();
        assert!(
            err.to_string().contains("not permitted"),
            "'{name}' should be rejected, got: {err}"
        );
    }

    let err = session
        .download("../evil.bin", &local.path().join("out"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not permitted"));
    assert!(session.delete("../evil.bin").await.unwrap().contains("not permitted"));

    // Nothing was written anywhere, and the session still works.
    assert!(session.list().await.unwrap().is_empty());
    assert!(!local.path().join("out").exists());

    session.quit().await.unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn view_returns_text_verbatim_and_binary_as_hex() {
    let storage = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    let (mut session, server) = spawn_session(storage.path());

    session.authenticate("alice", "secret").await.unwrap();

    let text = write_local(local.path(), "notes.txt", b"hello, world\n").await;
    session.upload(&text, "notes.txt").await.unwrap();
    let preview = session.view("notes.txt").await.unwrap();
    assert_eq!(
        preview,
        "File size: 13 bytes\nPreview of first 1024 bytes:\n\nhello, world\n"
    );

    let binary = write_local(local.path(), "blob", &[0xff, 0x00, 0xab, 0x10]).await;
    session.upload(&binary, "blob").await.unwrap();
    let preview = session.view("blob").await.unwrap();
    assert!(preview.starts_with("File size: 4 bytes\n"));
    assert!(preview.contains("[Binary file preview]\nff 00 ab 10\n[Preview truncated...]"));

    assert_eq!(session.view("absent").await.unwrap(), "File not found");

    session.quit().await.unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn concurrent_sessions_for_different_identities_are_isolated() {
    let storage = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();

    let (mut alice, alice_srv) = spawn_session(storage.path());
    let (mut bob, bob_srv) = spawn_session(storage.path());

    let alice_data = patterned_bytes(3000);
    let bob_data: Vec<u8> = patterned_bytes(4000).into_iter().rev().collect();
    let alice_path = write_local(local.path(), "alice.bin", &alice_data).await;
    let bob_path = write_local(local.path(), "bob.bin", &bob_data).await;

    let (alice_result, bob_result) = tokio::join!(
        async {
            alice.authenticate("alice", "secret").await?;
            alice.upload(&alice_path, "shared-name.bin").await?;
            let fetched = local.path().join("alice-fetched.bin");
            alice.download("shared-name.bin", &fetched).await?;
            alice.quit().await?;
            anyhow::Ok(fetched)
        },
        async {
            bob.authenticate("bob", "hunter2").await?;
            bob.upload(&bob_path, "shared-name.bin").await?;
            let fetched = local.path().join("bob-fetched.bin");
            bob.download("shared-name.bin", &fetched).await?;
            bob.quit().await?;
            anyhow::Ok(fetched)
        }
    );

    let alice_fetched = alice_result.unwrap();
    let bob_fetched = bob_result.unwrap();
    alice_srv.await.unwrap().unwrap();
    bob_srv.await.unwrap().unwrap();

    // Same filename, disjoint storage: neither saw the other's bytes.
    assert_eq!(tokio::fs::read(&alice_fetched).await.unwrap(), alice_data);
    assert_eq!(tokio::fs::read(&bob_fetched).await.unwrap(), bob_data);
    assert!(storage
        .path()
        .join("a")
        .join("alice")
        .join("shared-name.bin")
        .exists());
    assert!(storage
        .path()
        .join("b")
        .join("bob")
        .join("shared-name.bin")
        .exists());
}

/// Drive the wire by hand for the cases the client API never produces.
async fn raw_authenticate(
    reader: &mut (impl tokio::io::AsyncRead + Unpin),
    writer: &mut (impl tokio::io::AsyncWrite + Unpin),
) {
    assert_eq!(
        Framing::receive_control(reader).await.unwrap(),
        USERNAME_PROMPT
    );
    Framing::send_control(writer, "alice").await.unwrap();
    assert_eq!(
        Framing::receive_control(reader).await.unwrap(),
        PASSWORD_PROMPT
    );
    Framing::send_control(writer, "secret").await.unwrap();
    assert_eq!(
        Framing::receive_control(reader).await.unwrap(),
        AUTH_SUCCESSFUL
    );
}

#[tokio::test]
async fn unrecognized_command_is_non_fatal() {
    let storage = TempDir::new().unwrap();
    let (client_side, server_side) = duplex(64 * 1024);
    let resolver = StorageResolver::new(storage.path());
    let server = tokio::spawn(async move {
        serve_session(server_side, "test-peer", &StaticCreds, &resolver).await
    });

    let (mut reader, mut writer) = tokio::io::split(client_side);
    raw_authenticate(&mut reader, &mut writer).await;

    Framing::send_control(&mut writer, "frobnicate").await.unwrap();
    assert_eq!(
        Framing::receive_control(&mut reader).await.unwrap(),
        INVALID_ACTION
    );

    // The dispatcher kept going.
    Framing::send_control(&mut writer, "list").await.unwrap();
    assert_eq!(Framing::receive_control(&mut reader).await.unwrap(), NO_FILES);

    Framing::send_control(&mut writer, "quit").await.unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn download_streams_in_chunk_sized_frames() {
    let storage = TempDir::new().unwrap();

    // Seed a 5000-byte entry directly in alice's storage directory.
    let user_dir = storage.path().join("a").join("alice");
    std::fs::create_dir_all(&user_dir).unwrap();
    let contents = patterned_bytes(5000);
    std::fs::write(user_dir.join("data.bin"), &contents).unwrap();

    let (client_side, server_side) = duplex(64 * 1024);
    let resolver = StorageResolver::new(storage.path());
    let server = tokio::spawn(async move {
        serve_session(server_side, "test-peer", &StaticCreds, &resolver).await
    });

    let (mut reader, mut writer) = tokio::io::split(client_side);
    raw_authenticate(&mut reader, &mut writer).await;

    Framing::send_control(&mut writer, "download").await.unwrap();
    Framing::send_control(&mut writer, "data.bin").await.unwrap();

    let status = Framing::receive_control(&mut reader).await.unwrap();
    assert!(status.starts_with("OK 5000 "), "unexpected status: {status}");

    let mut sizes = Vec::new();
    let mut received = Vec::new();
    let mut buf = Vec::new();
    while let Some(n) = Framing::receive_chunk(&mut reader, &mut buf).await.unwrap() {
        sizes.push(n);
        received.extend_from_slice(&buf[..n]);
    }

    // 5000 bytes in 1024-byte chunks: four full frames plus one partial,
    // then the end-of-stream frame.
    assert_eq!(sizes, vec![1024, 1024, 1024, 1024, 904]);
    assert_eq!(received, contents);

    Framing::send_control(&mut writer, "quit").await.unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn disconnect_mid_upload_discards_the_partial_entry() {
    let storage = TempDir::new().unwrap();
    let (client_side, server_side) = duplex(64 * 1024);
    let resolver = StorageResolver::new(storage.path());
    let server = tokio::spawn(async move {
        serve_session(server_side, "test-peer", &StaticCreds, &resolver).await
    });

    let (mut reader, mut writer) = tokio::io::split(client_side);
    raw_authenticate(&mut reader, &mut writer).await;

    Framing::send_control(&mut writer, "upload").await.unwrap();
    Framing::send_control(&mut writer, "partial.bin").await.unwrap();
    assert_eq!(Framing::receive_control(&mut reader).await.unwrap(), READY);

    Framing::send_chunk(&mut writer, &[7u8; 1024]).await.unwrap();
    assert_eq!(Framing::receive_control(&mut reader).await.unwrap(), "ACK");

    // Vanish without an end-of-stream.
    drop(reader);
    drop(writer);

    let result = server.await.unwrap();
    assert!(matches!(result, Err(ProtocolError::ChannelClosed)));

    // The half-written entry is gone; nothing can later download it.
    let stored = storage.path().join("a").join("alice").join("partial.bin");
    assert!(!stored.exists());
}

#[tokio::test]
async fn disconnect_instead_of_quit_is_a_clean_end() {
    let storage = TempDir::new().unwrap();
    let (mut session, server) = spawn_session(storage.path());

    session.authenticate("alice", "secret").await.unwrap();
    drop(session);

    // At the awaiting-command state a disconnect is a normal way out.
    server.await.unwrap().unwrap();
}
