//! Coalesces dispatches and session opens that arrive close together into
//! one transport call each.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::transport::{SessionId, SessionSpec, SessionTransport, SessionWrite};
use crate::util::blocking;
use crate::{clog_debug, clog_warn, Error, Result};

enum Request {
    Write {
        write: SessionWrite,
        reply: oneshot::Sender<Result<()>>,
    },
    Open {
        spec: SessionSpec,
        reply: oneshot::Sender<Result<SessionId>>,
    },
}

#[derive(Clone)]
pub struct DispatchBatcher {
    tx: mpsc::Sender<Request>,
}

impl DispatchBatcher {
    /// Start the batching task. Must be called inside a tokio runtime.
    pub fn spawn(transport: Arc<dyn SessionTransport>, window: Duration, max_batch: usize) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(run(transport, rx, window, max_batch.max(1)));
        Self { tx }
    }

    pub async fn dispatch(&self, session: &str, text: &str, append_newline: bool) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        let request = Request::Write {
            write: SessionWrite {
                session: session.to_string(),
                text: text.to_string(),
                append_newline,
            },
            reply,
        };
        self.submit(request).await?;
        rx.await
            .map_err(|_| Error::invalid_state("dispatch batcher dropped the request"))?
    }

    /// Open a session, sharing the transport call with other opens in the
    /// same window.
    pub async fn open(&self, spec: SessionSpec) -> Result<SessionId> {
        let (reply, rx) = oneshot::channel();
        self.submit(Request::Open { spec, reply }).await?;
        rx.await
            .map_err(|_| Error::invalid_state("dispatch batcher dropped the request"))?
    }

    async fn submit(&self, request: Request) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| Error::invalid_state("dispatch batcher has stopped"))
    }
}

async fn run(
    transport: Arc<dyn SessionTransport>,
    mut rx: mpsc::Receiver<Request>,
    window: Duration,
    max_batch: usize,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        let deadline = Instant::now() + window;
        while batch.len() < max_batch {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(request)) => batch.push(request),
                Ok(None) | Err(_) => break,
            }
        }
        flush(&transport, batch).await;
    }
}

async fn flush(transport: &Arc<dyn SessionTransport>, batch: Vec<Request>) {
    let mut specs = Vec::new();
    let mut open_replies = Vec::new();
    let mut writes = Vec::new();
    let mut write_replies = Vec::new();
    for request in batch {
        match request {
            Request::Open { spec, reply } => {
                specs.push(spec);
                open_replies.push(reply);
            }
            Request::Write { write, reply } => {
                writes.push(write);
                write_replies.push(reply);
            }
        }
    }

    // Opens first: a write in the same window may target a new session
    if !specs.is_empty() {
        if specs.len() > 1 {
            clog_debug!("Opening batch of {} sessions", specs.len());
        }
        let t = transport.clone();
        let count = specs.len();
        let results = run_blocking(count, "open", move || t.open_batch(&specs)).await;
        for (reply, result) in open_replies.into_iter().zip(results) {
            let _ = reply.send(result);
        }
    }

    if !writes.is_empty() {
        if writes.len() > 1 {
            clog_debug!("Dispatching batch of {} writes", writes.len());
        }
        let t = transport.clone();
        let count = writes.len();
        let results = run_blocking(count, "dispatch", move || t.write_batch(&writes)).await;
        for (reply, result) in write_replies.into_iter().zip(results) {
            let _ = reply.send(result);
        }
    }
}

/// Run a batched transport call off the runtime. If the call itself never
/// ran, every caller gets the same transient error.
async fn run_blocking<T, F>(count: usize, what: &str, call: F) -> Vec<Result<T>>
where
    T: Send + 'static,
    F: FnOnce() -> Vec<Result<T>> + Send + 'static,
{
    match blocking(move || Ok(call())).await {
        Ok(results) => results,
        Err(e) => {
            clog_warn!("Batched {} did not run: {}", what, e);
            (0..count)
                .map(|_| Err(Error::TransientIo(e.to_string())))
                .collect()
        }
    }
}
