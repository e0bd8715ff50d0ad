//! Scripted transport and log capture shared by the session tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;

use speech_stream::streaming::protocol::encode_close_payload;
use speech_stream::streaming::{
    ConnectRequest, Frame, FrameSink, FrameSource, Transport, TransportError,
};

// ============================================================================
// Server scripts
// ============================================================================

/// One thing the fake server does on a connection
#[derive(Debug, Clone)]
pub enum Step {
    Send(Frame),
    Fail(TransportError),
    /// Block until the client has sent its EOS event on this connection
    AwaitClientEos,
    Sleep(Duration),
}

pub fn transcript(text: &str) -> Step {
    response("Transcript", text, false)
}

pub fn transcript_eos() -> Step {
    response("Transcript", "", true)
}

pub fn captions_eos() -> Step {
    response("Captions", "", true)
}

pub fn response(kind: &str, text: &str, eos: bool) -> Step {
    let body = json!({
        "response": {
            "id": "0f6a1b",
            "type": kind,
            "alternatives": [{"transcript": text}],
            "start": 0.0,
            "end": 1.0,
            "is_final": true,
            "is_end_of_stream": eos,
        }
    });
    Step::Send(Frame::Text(body.to_string()))
}

pub fn close(code: u16, reason: &str) -> Step {
    Step::Send(Frame::Close(encode_close_payload(code, reason)))
}

pub fn connection_lost() -> Step {
    Step::Fail(TransportError::Connection("connection reset by peer".into()))
}

/// How a connect call ends
#[derive(Debug, Clone)]
pub enum ConnectOutcome {
    Accept(Vec<Step>),
    /// Accept only after a delay; a connect dropped while waiting consumes nothing
    AcceptAfter(Duration, Vec<Step>),
    /// Accept, but binary sends on this connection never complete
    AcceptStalled(Vec<Step>),
    Reject(TransportError),
}

pub fn handshake(status: u16) -> ConnectOutcome {
    ConnectOutcome::Reject(TransportError::Handshake { status, body: None })
}

// ============================================================================
// Recording
// ============================================================================

/// What the client did on one connection
#[derive(Default)]
pub struct ConnectionLog {
    pub frames: Mutex<Vec<Frame>>,
    pub closes: Mutex<Vec<u16>>,
    pub client_eos: AtomicBool,
    pub eos_notify: Notify,
}

impl ConnectionLog {
    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().unwrap().clone()
    }

    pub fn close_codes(&self) -> Vec<u16> {
        self.closes.lock().unwrap().clone()
    }

    pub fn eos_events_sent(&self) -> usize {
        self.frames()
            .iter()
            .filter(|f| matches!(f, Frame::Text(t) if t.contains(r#""event":"EOS""#)))
            .count()
    }

    pub fn binary_chunks(&self) -> Vec<Vec<u8>> {
        self.frames()
            .into_iter()
            .filter_map(|f| match f {
                Frame::Binary(b) => Some(b),
                _ => None,
            })
            .collect()
    }

    async fn wait_for_client_eos(&self) {
        loop {
            let notified = self.eos_notify.notified();
            if self.client_eos.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

struct ScriptedSink {
    log: Arc<ConnectionLog>,
    closed: bool,
    stall_binary: bool,
}

#[async_trait]
impl FrameSink for ScriptedSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Connection("send after close".into()));
        }
        if self.stall_binary && matches!(frame, Frame::Binary(_)) {
            std::future::pending::<()>().await;
        }
        let is_eos = matches!(&frame, Frame::Text(t) if t.contains(r#""event":"EOS""#));
        self.log.frames.lock().unwrap().push(frame);
        if is_eos {
            self.log.client_eos.store(true, Ordering::SeqCst);
            self.log.eos_notify.notify_waiters();
        }
        Ok(())
    }

    async fn close(&mut self, code: u16) -> Result<(), TransportError> {
        self.closed = true;
        self.log.closes.lock().unwrap().push(code);
        Ok(())
    }
}

struct ScriptedSource {
    steps: VecDeque<Step>,
    log: Arc<ConnectionLog>,
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn recv(&mut self) -> Result<Frame, TransportError> {
        loop {
            match self.steps.pop_front() {
                Some(Step::Send(frame)) => return Ok(frame),
                Some(Step::Fail(e)) => return Err(e),
                Some(Step::AwaitClientEos) => self.log.wait_for_client_eos().await,
                Some(Step::Sleep(d)) => tokio::time::sleep(d).await,
                // Script exhausted: the server goes quiet
                None => std::future::pending::<()>().await,
            }
        }
    }
}

/// Fake transport that plays one outcome per connect call
#[derive(Default)]
pub struct ScriptedTransport {
    outcomes: Mutex<VecDeque<ConnectOutcome>>,
    connects: AtomicUsize,
    connect_times: Mutex<Vec<Instant>>,
    requests: Mutex<Vec<ConnectRequest>>,
    connections: Mutex<Vec<Arc<ConnectionLog>>>,
}

impl ScriptedTransport {
    pub fn new(outcomes: Vec<ConnectOutcome>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            ..Default::default()
        })
    }

    /// Every connect is accepted with the matching script
    pub fn accepting(scripts: Vec<Vec<Step>>) -> Arc<Self> {
        Self::new(scripts.into_iter().map(ConnectOutcome::Accept).collect())
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// When each connect call started
    pub fn connect_times(&self) -> Vec<Instant> {
        self.connect_times.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<ConnectRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn connection(&self, index: usize) -> Arc<ConnectionLog> {
        self.connections.lock().unwrap()[index].clone()
    }

    pub fn connections(&self) -> Vec<Arc<ConnectionLog>> {
        self.connections.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(
        &self,
        request: ConnectRequest,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connect_times.lock().unwrap().push(Instant::now());
        self.requests.lock().unwrap().push(request);

        let delay = match self.outcomes.lock().unwrap().front() {
            Some(ConnectOutcome::AcceptAfter(delay, _)) => Some(*delay),
            _ => None,
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ConnectOutcome::Reject(handshake_error(403)));

        let (steps, stall_binary) = match outcome {
            ConnectOutcome::Accept(steps) | ConnectOutcome::AcceptAfter(_, steps) => (steps, false),
            ConnectOutcome::AcceptStalled(steps) => (steps, true),
            ConnectOutcome::Reject(e) => return Err(e),
        };

        let log = Arc::new(ConnectionLog::default());
        self.connections.lock().unwrap().push(log.clone());
        Ok((
            Box::new(ScriptedSink {
                log: log.clone(),
                closed: false,
                stall_binary,
            }),
            Box::new(ScriptedSource {
                steps: steps.into(),
                log,
            }),
        ))
    }
}

fn handshake_error(status: u16) -> TransportError {
    TransportError::Handshake { status, body: None }
}

// ============================================================================
// Log capture
// ============================================================================

#[derive(Debug, Clone)]
pub struct Captured {
    pub level: log::Level,
    pub target: String,
    pub message: String,
}

struct CapturingLogger {
    records: Mutex<Vec<Captured>>,
}

impl log::Log for CapturingLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        self.records.lock().unwrap().push(Captured {
            level: record.level(),
            target: record.target().to_string(),
            message: record.args().to_string(),
        });
    }

    fn flush(&self) {}
}

static LOGGER: OnceLock<&'static CapturingLogger> = OnceLock::new();

fn logger() -> &'static CapturingLogger {
    LOGGER.get_or_init(|| {
        let logger: &'static CapturingLogger = Box::leak(Box::new(CapturingLogger {
            records: Mutex::new(Vec::new()),
        }));
        let _ = log::set_logger(logger);
        log::set_max_level(log::LevelFilter::Trace);
        logger
    })
}

/// Start capturing; give each test its own `target` to keep records apart
pub fn capture_logs() {
    logger();
}

/// Records emitted under `target`
pub fn logs_for(target: &str) -> Vec<Captured> {
    logger()
        .records
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.target == target)
        .cloned()
        .collect()
}

pub fn has_log(target: &str, level: log::Level, needle: &str) -> bool {
    logs_for(target)
        .iter()
        .any(|r| r.level == level && r.message.contains(needle))
}
