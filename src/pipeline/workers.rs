//! One persistent thread per inference engine.
//!
//! A worker accepts a job only while idle. The busy flag is raised by the
//! dispatcher and lowered by the worker as soon as `infer` returns, before the
//! reply is sent, so an engine is never offered a second frame while still
//! working on a previous (timed out) one.

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::detect::{EngineError, EngineKind, InferenceEngine, RecognitionResult};
use crate::frame::Frame;

pub(crate) struct Reply {
    pub kind: EngineKind,
    pub seq: u64,
    pub outcome: Result<RecognitionResult, EngineError>,
}

pub(crate) struct EngineWorker {
    kind: EngineKind,
    name: &'static str,
    busy: Arc<AtomicBool>,
    jobs: Option<Sender<Arc<Frame>>>,
    handle: Option<JoinHandle<Box<dyn InferenceEngine>>>,
}

impl EngineWorker {
    pub fn spawn(mut engine: Box<dyn InferenceEngine>, replies: Sender<Reply>) -> Result<Self> {
        let kind = engine.kind();
        let name = engine.name();
        let busy = Arc::new(AtomicBool::new(false));
        let (jobs_tx, jobs_rx) = bounded::<Arc<Frame>>(1);

        let worker_busy = busy.clone();
        let handle = std::thread::Builder::new()
            .name(format!("engine-{}", kind))
            .spawn(move || {
                for frame in jobs_rx.iter() {
                    let outcome = match frame.view() {
                        Ok(view) => engine.infer(&view),
                        Err(err) => Err(err),
                    };
                    let seq = frame.seq;
                    drop(frame);
                    worker_busy.store(false, Ordering::Release);
                    if replies.send(Reply { kind, seq, outcome }).is_err() {
                        break;
                    }
                }
                engine
            })
            .with_context(|| format!("spawn {} engine worker", kind))?;

        log::debug!("engine worker started: {} ({})", kind, name);
        Ok(Self {
            kind,
            name,
            busy,
            jobs: Some(jobs_tx),
            handle: Some(handle),
        })
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Hand `frame` to the engine. A worker still busy with an earlier frame
    /// reports `InferenceTimeout` for this one instead of queueing it.
    pub fn dispatch(&self, frame: &Arc<Frame>) -> Result<(), EngineError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::InferenceTimeout);
        }
        let Some(jobs) = &self.jobs else {
            self.busy.store(false, Ordering::Release);
            return Err(EngineError::ModelUnavailable(format!(
                "{} worker stopped",
                self.kind
            )));
        };
        match jobs.try_send(frame.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.busy.store(false, Ordering::Release);
                Err(EngineError::InferenceTimeout)
            }
            Err(TrySendError::Disconnected(_)) => {
                self.busy.store(false, Ordering::Release);
                Err(EngineError::ModelUnavailable(format!(
                    "{} worker exited",
                    self.kind
                )))
            }
        }
    }

    /// Close the job queue and wait for the current call (if any) to finish.
    /// Returns the engine for reuse on the next start.
    pub fn shutdown(mut self) -> Option<Box<dyn InferenceEngine>> {
        self.jobs.take();
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(engine) => Some(engine),
            Err(_) => {
                log::error!("{} engine worker panicked", self.kind);
                None
            }
        }
    }
}

impl Drop for EngineWorker {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::ScriptedEngine;
    use crate::frame::PixelFormat;
    use crossbeam_channel::unbounded;
    use std::time::Duration;

    fn frame(seq: u64) -> Arc<Frame> {
        Arc::new(Frame::new(seq, 2, 2, PixelFormat::Gray8, vec![100; 4]).unwrap())
    }

    #[test]
    fn replies_are_tagged_with_frame_seq() {
        let (tx, rx) = unbounded();
        let engine = ScriptedEngine::new(EngineKind::Classifier)
            .with_result(5, RecognitionResult::classification("onion", 0.9));
        let worker = EngineWorker::spawn(Box::new(engine), tx).unwrap();

        worker.dispatch(&frame(5)).unwrap();
        let reply = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(reply.seq, 5);
        assert_eq!(reply.kind, EngineKind::Classifier);
        assert_eq!(
            reply.outcome,
            Ok(RecognitionResult::classification("onion", 0.9))
        );
        assert!(worker.shutdown().is_some());
    }

    #[test]
    fn busy_worker_rejects_second_frame() {
        let (tx, rx) = unbounded();
        let engine =
            ScriptedEngine::new(EngineKind::Text).with_latency(Duration::from_millis(150));
        let calls = engine.calls();
        let worker = EngineWorker::spawn(Box::new(engine), tx).unwrap();

        worker.dispatch(&frame(1)).unwrap();
        assert_eq!(worker.dispatch(&frame(2)), Err(EngineError::InferenceTimeout));

        let reply = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(reply.seq, 1);
        assert!(worker.dispatch(&frame(3)).is_ok());
        let reply = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(reply.seq, 3);

        worker.shutdown();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn released_frame_is_reported_invalid() {
        let (tx, rx) = unbounded();
        let engine =
            ScriptedEngine::new(EngineKind::Text).with_latency(Duration::from_secs(5));
        let worker = EngineWorker::spawn(Box::new(engine), tx).unwrap();

        let f = frame(9);
        worker.dispatch(&f).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        f.release();
        let reply = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(reply.outcome, Err(EngineError::InvalidFrame));
    }
}
