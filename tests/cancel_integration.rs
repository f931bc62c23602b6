mod support;

use std::time::Duration;

use anyhow::Result;

use fetchstore::store::CacheKey;
use fetchstore::transfer::{CacheDirective, FetchErrorKind, FetchState, Priority};

use support::*;

const STALLED: &str = "HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc";

#[tokio::test]
async fn last_detach_aborts_shared_transfer() -> Result<()> {
    let upstream = TestUpstream::start(vec![Reply::raw(STALLED).stall()]).await?;
    let engine = test_engine(1 << 20);
    let url = upstream.url("/slow");

    let first = engine.fetch(&url, Priority::Main, CacheDirective::UseCache)?;
    wait_for_state(&first, |state| {
        matches!(state, FetchState::Transferring { received: 3, .. })
    })
    .await?;
    let second = engine.fetch(&url, Priority::Image, CacheDirective::UseCache)?;
    assert_eq!(first.key(), second.key());
    assert_eq!(engine.in_flight(), 1);

    first.cancel();
    assert_eq!(engine.in_flight(), 1);
    second.cancel();
    assert_eq!(engine.in_flight(), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let stats = engine.stats();
    assert_eq!(stats.loading, 0);
    assert_eq!(stats.pinned, 0);
    assert_eq!(upstream.accepts(), 1);
    Ok(())
}

#[tokio::test]
async fn progress_reports_expected_length() -> Result<()> {
    let upstream = TestUpstream::start(vec![Reply::raw(STALLED).stall()]).await?;
    let engine = test_engine(1 << 20);

    let conn = engine.fetch(&upstream.url("/slow"), Priority::Main, CacheDirective::UseCache)?;
    let state = wait_for_state(&conn, |state| {
        matches!(state, FetchState::Transferring { received: 3, .. })
    })
    .await?;
    assert_eq!(
        state,
        FetchState::Transferring {
            received: 3,
            expected: Some(10)
        }
    );
    Ok(())
}

#[tokio::test]
async fn cancelled_download_resumes_later() -> Result<()> {
    let upstream = TestUpstream::start(vec![
        Reply::raw(STALLED).stall(),
        Reply::status(
            "206 Partial Content",
            "defghij",
            &["Content-Range: bytes 3-9/10"],
        ),
    ])
    .await?;
    let engine = test_engine(1 << 20);
    let url = upstream.url("/resumable");

    let conn = engine.fetch(&url, Priority::Main, CacheDirective::UseCache)?;
    wait_for_state(&conn, |state| {
        matches!(state, FetchState::Transferring { received: 3, .. })
    })
    .await?;
    conn.cancel();

    let key = CacheKey::for_url(&url)?.into_string();
    assert_eq!(cached_text(&engine, &key), "abc");

    let outcome = engine
        .fetch(&url, Priority::Main, CacheDirective::UseCache)?
        .wait()
        .await?;
    assert_eq!(cached_text(&engine, &outcome.key), "abcdefghij");
    assert!(upstream.requests()[1].contains("Range: bytes=3-\r\n"));
    Ok(())
}

#[tokio::test]
async fn abort_background_stops_preloads_only() -> Result<()> {
    let upstream = TestUpstream::start(vec![
        Reply::raw(STALLED).stall(),
        Reply::raw(STALLED).stall(),
    ])
    .await?;
    let engine = test_engine(1 << 20);

    let mut preload = engine.fetch(
        &upstream.url("/later"),
        Priority::Preload,
        CacheDirective::UseCache,
    )?;
    let main = engine.fetch(&upstream.url("/now"), Priority::Main, CacheDirective::UseCache)?;
    wait_for_state(&main, |state| matches!(state, FetchState::Transferring { .. })).await?;

    assert_eq!(engine.abort_background(), 1);
    let err = preload.wait().await.expect_err("aborted");
    assert_eq!(err.kind(), FetchErrorKind::Cancelled);
    assert_eq!(engine.in_flight(), 1);
    assert!(!main.state().is_finished());
    Ok(())
}

#[tokio::test]
async fn shutdown_cancels_everything() -> Result<()> {
    let upstream = TestUpstream::start(vec![Reply::raw(STALLED).stall()]).await?;
    let engine = test_engine(1 << 20);

    let mut conn = engine.fetch(&upstream.url("/slow"), Priority::Main, CacheDirective::UseCache)?;
    wait_for_state(&conn, |state| matches!(state, FetchState::Transferring { .. })).await?;
    engine.shutdown().await;

    assert_eq!(engine.in_flight(), 0);
    let err = conn.wait().await.expect_err("shut down");
    assert_eq!(err.kind(), FetchErrorKind::Cancelled);
    Ok(())
}
