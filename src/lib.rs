pub mod cli;
pub mod decode;
pub mod logging;
pub mod metrics;
pub mod settings;
pub mod store;
pub mod transfer;
pub mod util;

use std::io::Write;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::{
    cli::Cli,
    decode::DecodeBridge,
    settings::Settings,
    store::{ObjectStore, SharedStore},
    transfer::{Engine, EngineConfig, FetchOutcome, FetchRequest, PostBody},
};

pub async fn run(settings: Settings, cli: Cli) -> Result<()> {
    let store = SharedStore::new(ObjectStore::new(
        settings.cache_quota,
        settings.cache_gc_percent,
    ));
    let engine = Engine::new(EngineConfig::from_settings(&settings), store);
    info!(
        quota = settings.cache_quota,
        gc_percent = settings.cache_gc_percent,
        urls = cli.urls.len(),
        "fetchstore starting"
    );

    let mut last = None;
    for url in &cli.urls {
        let outcome = fetch_following(&engine, &settings, &cli, url).await?;
        last = Some(outcome);
    }

    if let Some(outcome) = last {
        let body = stored_body(&engine, &outcome)?;
        match &cli.output {
            Some(path) => std::fs::write(path, &body)
                .with_context(|| format!("failed to write {}", path.display()))?,
            None => std::io::stdout()
                .write_all(&body)
                .context("failed to write body to stdout")?,
        }
    }

    if cli.stats {
        print_stats(&engine)?;
    }
    engine.shutdown().await;
    Ok(())
}

async fn fetch_following(
    engine: &Engine,
    settings: &Settings,
    cli: &Cli,
    url: &str,
) -> Result<FetchOutcome> {
    let mut url = url.to_string();
    let mut body = cli.post.clone().map(PostBody::form);
    let mut redirects = 0;
    loop {
        let request = match body.clone() {
            Some(body) => FetchRequest::post(url.as_str(), body),
            None => FetchRequest::get(url.as_str()),
        }
        .directive(cli.directive);
        let mut conn = engine.submit(request)?;
        let outcome = conn.wait().await?;

        if let Some(realm) = &outcome.auth_challenge {
            warn!(url = %url, realm = %realm, "server requires credentials");
        }
        let Some(redirect) = outcome.redirect.clone().filter(|_| cli.follow_redirects) else {
            return Ok(outcome);
        };
        redirects += 1;
        if redirects > settings.max_redirects {
            bail!("too many redirects fetching {url}");
        }
        info!(from = %url, to = %redirect.location, "following redirect");
        if redirect.force_get {
            body = None;
        }
        url = redirect.location;
    }
}

/// Body bytes as stored, with any encoding that was kept on them removed.
fn stored_body(engine: &Engine, outcome: &FetchOutcome) -> Result<Vec<u8>> {
    let encoding = engine
        .store()
        .lock()
        .entry(&outcome.key)
        .and_then(|entry| entry.encoding());
    let (bytes, _range) = engine.read_available(&outcome.key).unwrap_or_default();
    match encoding {
        None => Ok(bytes.to_vec()),
        Some(encoding) => {
            let mut bridge = DecodeBridge::new(Some(encoding));
            let mut decoded = bridge.decode_all(&bytes)?.to_vec();
            decoded.extend_from_slice(&bridge.finish()?);
            Ok(decoded)
        }
    }
}

fn print_stats(engine: &Engine) -> Result<()> {
    let stats = engine.stats();
    let entries = engine.store().lock().list();
    let mut err = std::io::stderr().lock();
    writeln!(
        err,
        "cache: {} bytes in {} entries ({} pinned, {} loading)",
        stats.bytes, stats.entries, stats.pinned, stats.loading
    )?;
    for entry in entries {
        writeln!(
            err,
            "  {} length={} bytes={} fragments={}{}",
            entry.key,
            entry.length,
            entry.bytes,
            entry.fragments,
            if entry.incomplete { " incomplete" } else { "" }
        )?;
    }
    err.write_all(&metrics::gather())?;
    Ok(())
}
