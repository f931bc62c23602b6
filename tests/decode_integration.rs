mod support;

use std::io::Write;

use anyhow::Result;
use flate2::{Compression, write::GzEncoder};

use fetchstore::decode::{ContentEncoding, DecodeBridge};
use fetchstore::transfer::{CacheDirective, FetchErrorKind, Priority};

use support::*;

const TEXT: &str = "<html><body>compressed page, compressed page, compressed page</body></html>";

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn bzip2(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn chunked(body: &[u8], chunk: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for piece in body.chunks(chunk) {
        out.extend_from_slice(format!("{:x}\r\n", piece.len()).as_bytes());
        out.extend_from_slice(piece);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"0\r\n\r\n");
    out
}

#[tokio::test]
async fn gzip_text_is_decoded_into_the_store() -> Result<()> {
    let upstream = TestUpstream::start(vec![Reply::ok(
        gzip(TEXT.as_bytes())?,
        &["Content-Type: text/html", "Content-Encoding: gzip"],
    )])
    .await?;
    let engine = test_engine(1 << 20);

    let outcome = engine
        .fetch(&upstream.url("/page"), Priority::Main, CacheDirective::UseCache)?
        .wait()
        .await?;

    assert_eq!(outcome.length, TEXT.len() as u64);
    assert_eq!(cached_text(&engine, &outcome.key), TEXT);
    let store = engine.store().lock();
    let entry = store.entry(&outcome.key).expect("entry");
    assert!(entry.is_decoded());
    assert_eq!(entry.encoding(), None);
    Ok(())
}

#[tokio::test]
async fn gzip_binary_is_stored_encoded() -> Result<()> {
    let compressed = gzip(b"\x00\x01binary payload\x02\x03")?;
    let upstream = TestUpstream::start(vec![Reply::ok(
        &compressed,
        &[
            "Content-Type: application/octet-stream",
            "Content-Encoding: gzip",
        ],
    )])
    .await?;
    let engine = test_engine(1 << 20);

    let outcome = engine
        .fetch(&upstream.url("/blob"), Priority::Main, CacheDirective::UseCache)?
        .wait()
        .await?;

    assert_eq!(outcome.length, compressed.len() as u64);
    {
        let store = engine.store().lock();
        let entry = store.entry(&outcome.key).expect("entry");
        assert!(!entry.is_decoded());
        assert_eq!(entry.encoding(), Some(ContentEncoding::Gzip));
    }

    let (raw, _) = engine.read_available(&outcome.key).expect("cached bytes");
    assert_eq!(&raw[..], &compressed[..]);
    let mut bridge = DecodeBridge::new(Some(ContentEncoding::Gzip));
    let mut decoded = bridge.decode_all(&raw)?.to_vec();
    decoded.extend_from_slice(&bridge.finish()?);
    assert_eq!(decoded, b"\x00\x01binary payload\x02\x03");
    Ok(())
}

#[tokio::test]
async fn chunked_bzip2_text_is_decoded() -> Result<()> {
    let body = chunked(&bzip2(TEXT.as_bytes())?, 7);
    let mut reply =
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nContent-Encoding: bzip2\r\n\r\n".to_vec();
    reply.extend_from_slice(&body);
    let upstream = TestUpstream::start(vec![Reply::raw(reply)]).await?;
    let engine = test_engine(1 << 20);

    let outcome = engine
        .fetch(&upstream.url("/bz"), Priority::Main, CacheDirective::UseCache)?
        .wait()
        .await?;

    assert_eq!(cached_text(&engine, &outcome.key), TEXT);
    assert!(engine.store().lock().entry(&outcome.key).expect("entry").is_decoded());
    Ok(())
}

#[tokio::test]
async fn unknown_encoding_is_stored_as_is() -> Result<()> {
    let upstream = TestUpstream::start(vec![Reply::ok(
        "opaque",
        &["Content-Type: text/plain", "Content-Encoding: br"],
    )])
    .await?;
    let engine = test_engine(1 << 20);

    let outcome = engine
        .fetch(&upstream.url("/br"), Priority::Main, CacheDirective::UseCache)?
        .wait()
        .await?;
    assert_eq!(cached_text(&engine, &outcome.key), "opaque");
    let store = engine.store().lock();
    let entry = store.entry(&outcome.key).expect("entry");
    assert!(!entry.is_decoded());
    assert_eq!(entry.encoding(), None);
    Ok(())
}

#[tokio::test]
async fn corrupt_gzip_fails_the_transfer() -> Result<()> {
    let upstream = TestUpstream::start(vec![Reply::ok(
        "definitely not gzip",
        &["Content-Type: text/plain", "Content-Encoding: gzip"],
    )])
    .await?;
    let engine = test_engine(1 << 20);

    let result = engine
        .fetch(&upstream.url("/bad"), Priority::Main, CacheDirective::UseCache)?
        .wait()
        .await;
    assert!(result.is_err());
    Ok(())
}

fn numbered_lines() -> Vec<u8> {
    (0..2_000u32)
        .flat_map(|n| format!("line {n}\n").into_bytes())
        .collect()
}

async fn fetch_truncated(encoding: &str, compressed: &[u8]) -> Result<()> {
    let mut reply = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Encoding: {encoding}\r\n\r\n"
    )
    .into_bytes();
    reply.extend_from_slice(&compressed[..compressed.len() / 2]);
    let upstream = TestUpstream::start(vec![Reply::raw(reply).close()]).await?;
    let engine = test_engine(1 << 20);

    let mut conn = engine.fetch(&upstream.url("/cut"), Priority::Main, CacheDirective::UseCache)?;
    let err = tokio::time::timeout(std::time::Duration::from_secs(5), conn.wait())
        .await?
        .expect_err("truncated stream");
    assert_eq!(err.kind(), FetchErrorKind::Decode, "{err}");
    assert_eq!(upstream.requests().len(), 1);
    Ok(())
}

#[tokio::test]
async fn truncated_gzip_body_fails_the_transfer() -> Result<()> {
    fetch_truncated("gzip", &gzip(&numbered_lines())?).await
}

#[tokio::test]
async fn truncated_bzip2_body_fails_the_transfer() -> Result<()> {
    fetch_truncated("bzip2", &bzip2(&numbered_lines())?).await
}
