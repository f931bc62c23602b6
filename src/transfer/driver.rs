//! Runs one transfer: cache check, connection setup, request, response
//! streaming into the store, and the retry loop around all of it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use http::{Method, StatusCode, Uri};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::decode::DecodeBridge;
use crate::logging::TransferLogBuilder;
use crate::store::{EvictMode, PinGuard, StoreError, Validators, WriterGuard};
use crate::util::timeout_with_context;

use super::body::BodyPlan;
use super::codec::ResponseHead;
use super::connect::connect_to_addrs;
use super::error::FetchError;
use super::pool::PoolKey;
use super::request::{RequestPlan, build_request};
use super::response::{ResponseInfo, interpret};
use super::state::{FetchOutcome, FetchState, ReaderEvent, ResponseReader};
use super::{CacheDirective, EngineInner, FetchRequest, Priority};

const READ_BUFFER_SIZE: usize = 16 * 1024;
/// Yields granted to an aborted transfer on the same key to release its
/// writer claim.
const WRITER_CLAIM_YIELDS: usize = 8;

#[derive(Debug)]
pub(super) struct Job {
    key: String,
    uri: Uri,
    method: Method,
    request: FetchRequest,
}

impl Job {
    pub(super) fn new(key: String, uri: Uri, request: FetchRequest) -> Self {
        Self {
            key,
            uri,
            method: request.method(),
            request,
        }
    }

    pub(super) fn priority(&self) -> Priority {
        self.request.priority
    }

    fn host(&self) -> &str {
        self.uri.host().unwrap_or_default()
    }

    fn port(&self) -> u16 {
        self.uri.port_u16().unwrap_or(80)
    }
}

/// What one attempt found out about the cached state before it started.
#[derive(Debug, Default)]
struct Prior {
    resume_from: Option<u64>,
    resume_validator: Option<String>,
    if_modified_since: Option<String>,
}

enum Attempt {
    Done(FetchOutcome),
    /// The resource changed under a resumed download; start over from 0.
    Restart,
}

#[derive(Debug, Default)]
struct Report {
    attempts: u32,
    resumed_from: Option<u64>,
    upstream: Option<SocketAddr>,
    reused: Option<bool>,
}

pub(super) async fn run(inner: Arc<EngineInner>, job: Job, state: watch::Sender<FetchState>) {
    let started = Instant::now();
    let mut report = Report::default();
    let result = Transfer {
        inner: &inner,
        job: &job,
        state: &state,
    }
    .execute(&mut report)
    .await;

    let mut log = TransferLogBuilder::new(job.key.as_str())
        .method(job.method.as_str())
        .priority(job.priority().as_str())
        .directive(job.request.directive.as_str())
        .attempts(report.attempts)
        .elapsed(started.elapsed());
    if let Some(offset) = report.resumed_from {
        log = log.resumed_from(offset);
    }
    if let Some(addr) = report.upstream {
        log = log.upstream_addr(addr.to_string());
    }
    if let Some(reused) = report.reused {
        log = log.upstream_reused(reused);
    }
    log = match &result {
        Ok(outcome) => {
            let mut log = log
                .outcome(if outcome.from_cache { "cached" } else { "complete" })
                .from_cache(outcome.from_cache)
                .bytes(outcome.length);
            if let Some(status) = outcome.status {
                log = log.status(status);
            }
            log
        }
        Err(err) => log
            .outcome("failed")
            .error_kind(err.kind().as_str())
            .error_detail(err.message()),
    };
    log.log();

    state.send_replace(FetchState::Finished(result));
}

struct Transfer<'a> {
    inner: &'a EngineInner,
    job: &'a Job,
    state: &'a watch::Sender<FetchState>,
}

impl Transfer<'_> {
    async fn execute(&self, report: &mut Report) -> Result<FetchOutcome, FetchError> {
        if self.job.uri.scheme_str() != Some("http") {
            return Err(FetchError::unsupported(format!(
                "scheme of '{}' is not supported",
                self.job.uri
            )));
        }
        if let Some(outcome) = self.serve_from_cache()? {
            return Ok(outcome);
        }
        let (_writer, _pin) = self.claim().await?;

        let max_tries = self.inner.config.max_tries.max(1);
        let mut tries = 0;
        let mut restarted = false;
        loop {
            tries += 1;
            report.attempts += 1;
            match self.attempt(report).await {
                Ok(Attempt::Done(outcome)) => return Ok(outcome),
                Ok(Attempt::Restart) if !restarted => {
                    restarted = true;
                    tries -= 1;
                }
                Ok(Attempt::Restart) => {
                    return Err(FetchError::protocol(
                        "resource changed again while restarting the download",
                    ));
                }
                Err(err) if err.is_retryable() && tries < max_tries => {
                    crate::metrics::record_transport_retry();
                    warn!(
                        key = %self.job.key,
                        attempt = tries,
                        error = %err,
                        "transport failure before response; retrying"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// A complete, fresh entry satisfies `UseCache` without a request.
    fn serve_from_cache(&self) -> Result<Option<FetchOutcome>, FetchError> {
        let mut store = self.inner.store.lock();
        let entry = store.lookup_or_create(&self.job.key)?;
        let usable = self.job.request.directive == CacheDirective::UseCache
            && !entry.is_incomplete()
            && entry.head().is_some()
            && !entry.validators().expiry.is_stale(SystemTime::now());
        if !usable {
            return Ok(None);
        }
        debug!(key = %self.job.key, "serving from cache");
        Ok(Some(FetchOutcome {
            key: self.job.key.clone(),
            status: None,
            length: entry.length(),
            from_cache: true,
            not_modified: false,
            redirect: entry.redirect().cloned(),
            auth_challenge: None,
        }))
    }

    async fn claim(&self) -> Result<(WriterGuard, PinGuard), FetchError> {
        let mut yields = 0;
        loop {
            {
                let mut store = self.inner.store.lock();
                store.lookup_or_create(&self.job.key)?;
                match store.claim_writer(&self.job.key) {
                    Ok(writer) => {
                        let pin = store
                            .pin(&self.job.key)
                            .ok_or_else(|| StoreError::UnknownEntry(self.job.key.clone()))?;
                        return Ok((writer, pin));
                    }
                    Err(StoreError::WriterBusy(_)) if yields < WRITER_CLAIM_YIELDS => {}
                    Err(err) => return Err(err.into()),
                }
            }
            yields += 1;
            tokio::task::yield_now().await;
        }
    }

    fn prior(&self) -> Prior {
        let store = self.inner.store.lock();
        let Some(entry) = store.entry(&self.job.key) else {
            return Prior::default();
        };
        let directive = self.job.request.directive;
        let mut prior = Prior::default();
        if directive == CacheDirective::ForceReload {
            return prior;
        }
        let last_modified = entry.validators().last_modified.clone();
        if entry.is_incomplete() {
            let prefix = entry.contiguous_prefix();
            let resumable = self.job.method == Method::GET
                && prefix > 0
                && !entry.is_decoded()
                && entry.encoding().is_none();
            if resumable {
                prior.resume_from = Some(prefix);
                prior.resume_validator = last_modified;
            }
        } else if entry.head().is_some() {
            prior.if_modified_since = last_modified;
        }
        prior
    }

    async fn attempt(&self, report: &mut Report) -> Result<Attempt, FetchError> {
        let prior = self.prior();
        report.resumed_from = prior.resume_from;

        let (mut stream, peer, reused) = self.open().await?;
        report.upstream = Some(peer);
        report.reused = Some(reused);

        let host = self.job.host();
        let path = self.job.uri.path();
        let authorization = self.inner.credentials.lookup(host, None);
        let cookie = self.inner.cookies.cookies_for(host, path);
        let request = build_request(
            &self.inner.config.request,
            &RequestPlan {
                method: &self.job.method,
                uri: &self.job.uri,
                referer: self.job.request.referer.as_deref(),
                force_reload: self.job.request.directive == CacheDirective::ForceReload,
                if_modified_since: prior.if_modified_since.as_deref(),
                range_from: prior.resume_from,
                authorization: authorization.as_deref(),
                cookie: cookie.as_deref(),
                body: self.job.request.body.as_ref(),
            },
        );
        timeout_with_context(
            self.inner.config.io_timeout,
            stream.write_all(&request),
            format!("sending request to {peer}"),
        )
        .await
        .map_err(|err| FetchError::classify(&err, false))?;
        self.publish(FetchState::RequestSent);
        debug!(key = %self.job.key, %peer, reused, resume_from = prior.resume_from, "request sent");

        self.publish(FetchState::AwaitingHead);
        self.receive(stream, peer, &prior).await
    }

    async fn open(&self) -> Result<(TcpStream, SocketAddr, bool), FetchError> {
        let key = PoolKey::new(self.job.host(), self.job.port());
        let pooled = {
            let mut pool = self.inner.pool.lock();
            pool.prune();
            pool.take(&key)
        };
        if let Some(conn) = pooled {
            crate::metrics::record_pool_reuse(true);
            debug!(key = %self.job.key, peer = %conn.peer, "reusing idle connection");
            return Ok((conn.stream, conn.peer, true));
        }
        crate::metrics::record_pool_reuse(false);

        self.publish(FetchState::Resolving);
        let addrs = self
            .inner
            .resolver
            .resolve(self.job.host(), self.job.port())
            .await
            .map_err(|err| FetchError::classify(&err, false))?;
        self.publish(FetchState::Connecting);
        let (stream, peer) = connect_to_addrs(&addrs, self.inner.config.connect_timeout)
            .await
            .map_err(|err| FetchError::classify(&err, false))?;
        Ok((stream, peer, false))
    }

    async fn receive(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        prior: &Prior,
    ) -> Result<Attempt, FetchError> {
        let mut reader = ResponseReader::new(self.inner.config.max_header_size);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut sink: Option<BodySink> = None;
        let mut eof = false;

        loop {
            while let Some(event) = reader.poll()? {
                match event {
                    ReaderEvent::Head(head) if head.is_interim() => {
                        debug!(key = %self.job.key, status = head.status.as_u16(), "skipping interim response");
                        reader.expect_next_head();
                    }
                    ReaderEvent::Head(head) => {
                        let info = interpret(&head, &self.job.method, &self.job.uri)?;
                        debug!(
                            key = %self.job.key,
                            status = info.status.as_u16(),
                            body = ?info.body,
                            keep_alive = info.keep_alive,
                            "response head parsed"
                        );
                        if self.resource_changed(&info, prior)? {
                            return Ok(Attempt::Restart);
                        }
                        let cursor = self.apply_head(&head, &info, prior)?;
                        reader.start_body(info.body);
                        let body = BodySink {
                            bridge: DecodeBridge::new(info.decode),
                            cursor,
                            expected: info.expected_length(),
                            info,
                        };
                        body.publish(self);
                        sink = Some(body);
                    }
                    ReaderEvent::Payload(data) => {
                        if let Some(body) = sink.as_mut() {
                            body.write(self, &data)?;
                        }
                    }
                    ReaderEvent::Complete => {
                        let Some(mut body) = sink.take() else {
                            return Err(FetchError::protocol("response ended without a head"));
                        };
                        body.flush(self)?;
                        let outcome = self.finish(&body)?;
                        let reusable = body.info.keep_alive
                            && body.info.body != BodyPlan::UntilClose
                            && reader.leftover() == 0;
                        if reusable {
                            self.inner.pool.lock().put(
                                PoolKey::new(self.job.host(), self.job.port()),
                                stream,
                                peer,
                            );
                        } else {
                            debug!(key = %self.job.key, %peer, "closing connection after response");
                        }
                        return Ok(Attempt::Done(outcome));
                    }
                }
            }

            if eof {
                return Err(FetchError::protocol("connection closed before the response ended")
                    .after_response());
            }
            let read = timeout_with_context(
                self.inner.config.io_timeout,
                stream.read(&mut buf),
                format!("reading response from {peer}"),
            )
            .await
            .map_err(|err| FetchError::classify(&err, reader.received() > 0))?;
            if read == 0 {
                trace!(key = %self.job.key, "peer closed connection");
                eof = true;
                reader.on_eof();
            } else {
                trace!(key = %self.job.key, len = read, "received bytes");
                reader.push(&buf[..read]);
            }
        }
    }

    /// Detects a `Last-Modified` change under a resumed download and clears
    /// the entry so the next attempt starts from 0.
    fn resource_changed(&self, info: &ResponseInfo, prior: &Prior) -> Result<bool, FetchError> {
        if prior.resume_from.is_none() || info.status != StatusCode::PARTIAL_CONTENT {
            return Ok(false);
        }
        let changed = match (&prior.resume_validator, &info.last_modified) {
            (Some(before), Some(now)) => before != now,
            _ => false,
        };
        if changed {
            warn!(
                key = %self.job.key,
                before = prior.resume_validator.as_deref(),
                now = info.last_modified.as_deref(),
                "resource changed during resumed download; restarting"
            );
            self.inner.store.lock().invalidate(&self.job.key)?;
        }
        Ok(changed)
    }

    /// Records the head on the entry and returns the offset body bytes start
    /// at.
    fn apply_head(
        &self,
        head: &ResponseHead,
        info: &ResponseInfo,
        prior: &Prior,
    ) -> Result<u64, FetchError> {
        let host = self.job.host();
        for set_cookie in &info.set_cookies {
            self.inner.cookies.remember(host, set_cookie);
        }
        if let Some(realm) = &info.challenge {
            debug!(key = %self.job.key, realm = %realm, "server asked for credentials");
            self.inner.credentials.register_challenge(host, realm);
        }

        let headers = head.header_map();
        let now = SystemTime::now();
        let mut store = self.inner.store.lock();
        let key = self.job.key.as_str();
        let status = info.status;

        if status == StatusCode::NOT_MODIFIED {
            let entry = store
                .entry_mut(key)
                .ok_or_else(|| StoreError::UnknownEntry(key.to_string()))?;
            let validators = entry.validators().revalidated(&headers, now);
            entry.set_validators(validators);
            entry.mark_complete();
            return Ok(0);
        }

        let cursor = if status == StatusCode::PARTIAL_CONTENT {
            let expected = prior.resume_from.unwrap_or(0);
            match info.content_range {
                Some(range) if range.start == expected => range.start,
                Some(range) => {
                    return Err(FetchError::protocol(format!(
                        "partial content starts at {} but {expected} bytes are cached",
                        range.start
                    )));
                }
                None => {
                    return Err(FetchError::protocol(
                        "partial content without a usable Content-Range",
                    ));
                }
            }
        } else {
            let has_data = store.entry(key).is_some_and(|entry| entry.data_size() > 0);
            let replaces = status != StatusCode::NO_CONTENT && self.job.method != Method::HEAD;
            if has_data && replaces {
                if prior.resume_from.is_some() {
                    debug!(key, "server ignored range request; restarting at 0");
                }
                store.invalidate(key)?;
            }
            0
        };

        let entry = store
            .entry_mut(key)
            .ok_or_else(|| StoreError::UnknownEntry(key.to_string()))?;
        entry.set_head(head.raw.clone());
        entry.set_redirect(info.redirect.clone());
        entry.set_validators(Validators::from_headers(&headers, now));
        entry.set_encoding(info.stored_encoding, info.decode.is_some());
        Ok(cursor)
    }

    fn finish(&self, body: &BodySink) -> Result<FetchOutcome, FetchError> {
        let status = body.info.status;
        let key = self.job.key.as_str();
        let mut store = self.inner.store.lock();
        let writes_body = status != StatusCode::NOT_MODIFIED
            && status != StatusCode::NO_CONTENT
            && self.job.method != Method::HEAD;
        if writes_body {
            store.truncate(key, body.cursor, true)?;
        }
        let length = {
            let entry = store
                .entry_mut(key)
                .ok_or_else(|| StoreError::UnknownEntry(key.to_string()))?;
            let prefix = entry.contiguous_prefix();
            if writes_body && prefix < entry.length() {
                return Err(FetchError::protocol(format!(
                    "cached body has a gap at {prefix} of {}",
                    entry.length()
                ))
                .after_response());
            }
            entry.mark_complete();
            entry.length()
        };
        store.evict(EvictMode::QuotaCheck);
        crate::metrics::set_cache_usage(store.total_size(), store.len() as u64);
        debug!(key, status = status.as_u16(), length, "transfer complete");

        Ok(FetchOutcome {
            key: key.to_string(),
            status: Some(status),
            length,
            from_cache: false,
            not_modified: status == StatusCode::NOT_MODIFIED,
            redirect: body.info.redirect.clone(),
            auth_challenge: body.info.challenge.clone(),
        })
    }

    fn publish(&self, state: FetchState) {
        self.state.send_replace(state);
    }
}

/// Decoded body bytes on their way into the store.
struct BodySink {
    info: ResponseInfo,
    bridge: DecodeBridge,
    cursor: u64,
    expected: Option<u64>,
}

impl BodySink {
    fn write(&mut self, transfer: &Transfer<'_>, mut input: &[u8]) -> Result<(), FetchError> {
        while !input.is_empty() {
            let accepted = self.bridge.push(input)?;
            input = &input[accepted..];
            let decoded = self.bridge.drain()?;
            self.store(transfer, &decoded)?;
        }
        self.publish(transfer);
        Ok(())
    }

    fn flush(&mut self, transfer: &Transfer<'_>) -> Result<(), FetchError> {
        let tail = self.bridge.finish()?;
        self.store(transfer, &tail)?;
        trace!(key = %transfer.job.key, decoded = self.bridge.produced(), "body flushed");
        self.publish(transfer);
        Ok(())
    }

    fn store(&mut self, transfer: &Transfer<'_>, data: &[u8]) -> Result<(), FetchError> {
        if data.is_empty() {
            return Ok(());
        }
        transfer
            .inner
            .store
            .lock()
            .write_range(&transfer.job.key, self.cursor, data)?;
        self.cursor += data.len() as u64;
        Ok(())
    }

    fn publish(&self, transfer: &Transfer<'_>) {
        transfer.publish(FetchState::Transferring {
            received: self.cursor,
            expected: self.expected,
        });
    }
}
