// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Backend running a blocking decode primitive on a worker thread.
//!
//! Some hardware APIs decode one sample per blocking call. [`ThreadedBackend`] turns such a
//! [`BlockingDecoder`] into an asynchronous session: samples are queued to a worker thread which
//! decodes them in order and reports each result through the session callback. The queue is
//! bounded, and [`DecodeSession::submit`] blocks while it is full.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::thread;
use std::thread::JoinHandle;

use nix::errno::Errno;
use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;
use thiserror::Error;

use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::DecodeSession;
use crate::backend::DecoderBackend;
use crate::backend::HwDecodeResult;
use crate::backend::SessionCallback;
use crate::backend::SubmissionTag;
use crate::decoder::DecoderConfig;
use crate::decoder::EncodedSample;
use crate::EncodedFormat;

/// Default number of samples that can wait for the worker before `submit` blocks.
pub const DEFAULT_QUEUE_DEPTH: usize = 8;

/// A decoder processing one sample per call, blocking until it is decoded.
pub trait BlockingDecoder: Send + 'static {
    type Picture: Send + 'static;

    fn decode(&mut self, sample: &EncodedSample) -> HwDecodeResult<Self::Picture>;
}

#[derive(Debug, Error)]
pub enum ThreadedBackendError {
    #[error("failed to create EventFd: {0}")]
    EventFdCreate(Errno),
    #[error("failed to wait on EventFd: {0}")]
    EventFdRead(Errno),
    #[error("failed to signal EventFd: {0}")]
    EventFdWrite(Errno),
    #[error("the worker thread is not running")]
    WorkerGone,
}

impl From<ThreadedBackendError> for BackendError {
    fn from(e: ThreadedBackendError) -> Self {
        BackendError::Other(e.into())
    }
}

enum Job {
    Decode(EncodedSample, SubmissionTag),
    /// Signals the EventFd once every job queued before it has been processed.
    Drain(Arc<EventFd>),
}

#[derive(Default)]
struct JobQueue {
    jobs: VecDeque<Job>,
    /// Set once the worker thread has stopped taking jobs.
    worker_exited: bool,
}

type WorkQueue = Arc<Mutex<JobQueue>>;

fn lock_queue(queue: &WorkQueue) -> MutexGuard<'_, JobQueue> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Closes the work queue when the worker thread ends, even by a panic, and wakes up the callers
/// waiting on it.
struct WorkerExitGuard {
    work_queue: WorkQueue,
    free_slots: Arc<EventFd>,
}

impl Drop for WorkerExitGuard {
    fn drop(&mut self) {
        let mut queue = lock_queue(&self.work_queue);
        queue.worker_exited = true;
        for job in queue.jobs.drain(..) {
            if let Job::Drain(done) = job {
                let _ = done.write(1);
            }
        }
        drop(queue);

        // A submit may be waiting for a slot.
        let _ = self.free_slots.write(1);
    }
}

/// Backend creating a [`BlockingDecoder`] per session with `opener`, and running it on a worker
/// thread.
pub struct ThreadedBackend<F, D> {
    opener: F,
    formats: Vec<EncodedFormat>,
    queue_depth: usize,
    _phantom: PhantomData<fn() -> D>,
}

impl<F, D> ThreadedBackend<F, D>
where
    F: FnMut(&DecoderConfig) -> anyhow::Result<D>,
    D: BlockingDecoder,
{
    /// Creates a backend for streams in one of `formats`. `opener` is called for each new session
    /// and may still refuse the configuration.
    pub fn new(formats: Vec<EncodedFormat>, opener: F) -> Self {
        Self {
            opener,
            formats,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            _phantom: PhantomData,
        }
    }

    /// Sets the number of samples that can be queued before `submit` blocks.
    pub fn with_queue_depth(mut self, queue_depth: usize) -> Self {
        self.queue_depth = queue_depth.clamp(1, u32::MAX as usize);
        self
    }
}

impl<F, D> DecoderBackend for ThreadedBackend<F, D>
where
    F: FnMut(&DecoderConfig) -> anyhow::Result<D>,
    D: BlockingDecoder,
{
    type Picture = D::Picture;
    type Session = ThreadedSession;

    fn supports(&self, config: &DecoderConfig) -> bool {
        self.formats.contains(&config.format)
    }

    fn open_session(
        &mut self,
        config: &DecoderConfig,
        callback: SessionCallback<Self::Picture>,
    ) -> BackendResult<Self::Session> {
        let decoder = (self.opener)(config)?;
        ThreadedSession::start(decoder, callback, self.queue_depth)
    }
}

/// Session of a [`ThreadedBackend`].
pub struct ThreadedSession {
    work_queue: WorkQueue,
    /// Counts queued jobs, waking up the worker.
    awaiting_job_event: Arc<EventFd>,
    /// Counts the remaining room in the work queue.
    free_slots: Arc<EventFd>,
    stopped: Arc<AtomicBool>,
    worker_thread: Option<JoinHandle<()>>,
}

impl ThreadedSession {
    fn start<D: BlockingDecoder>(
        mut decoder: D,
        callback: SessionCallback<D::Picture>,
        queue_depth: usize,
    ) -> BackendResult<Self> {
        let awaiting_job_event = Arc::new(
            EventFd::from_flags(EfdFlags::EFD_SEMAPHORE)
                .map_err(ThreadedBackendError::EventFdCreate)?,
        );
        let free_slots = Arc::new(
            EventFd::from_value_and_flags(
                u32::try_from(queue_depth).unwrap_or(u32::MAX),
                EfdFlags::EFD_SEMAPHORE,
            )
                .map_err(ThreadedBackendError::EventFdCreate)?,
        );
        let work_queue: WorkQueue = Default::default();
        let stopped = Arc::new(AtomicBool::new(false));

        let worker_thread = {
            let work_queue = work_queue.clone();
            let awaiting_job_event = awaiting_job_event.clone();
            let free_slots = free_slots.clone();
            let stopped = stopped.clone();

            thread::spawn(move || {
                let _exit_guard = WorkerExitGuard {
                    work_queue: work_queue.clone(),
                    free_slots: free_slots.clone(),
                };

                loop {
                    if let Err(e) = awaiting_job_event.read() {
                        log::error!("decode worker cannot wait for jobs: {}", e);
                        break;
                    }
                    if stopped.load(Ordering::Acquire) {
                        break;
                    }

                    // The job may have been abandoned by a reset.
                    let Some(job) = lock_queue(&work_queue).jobs.pop_front() else {
                        continue;
                    };

                    match job {
                        Job::Decode(sample, tag) => {
                            let result = decoder.decode(&sample);
                            callback.deliver(tag, result);
                            if let Err(e) = free_slots.write(1) {
                                log::error!("decode worker cannot release its slot: {}", e);
                                break;
                            }
                        }
                        Job::Drain(done) => {
                            if let Err(e) = done.write(1) {
                                log::error!("decode worker cannot signal drain: {}", e);
                                break;
                            }
                        }
                    }
                }
            })
        };

        Ok(Self {
            work_queue,
            awaiting_job_event,
            free_slots,
            stopped,
            worker_thread: Some(worker_thread),
        })
    }

    /// Whether the worker thread is still running.
    pub fn is_alive(&self) -> bool {
        match &self.worker_thread {
            Some(worker_thread) => !worker_thread.is_finished(),
            None => false,
        }
    }

    fn queue_job(&self, job: Job) -> BackendResult<()> {
        {
            let mut queue = lock_queue(&self.work_queue);
            if queue.worker_exited {
                return Err(ThreadedBackendError::WorkerGone.into());
            }
            queue.jobs.push_back(job);
        }
        self.awaiting_job_event
            .write(1)
            .map_err(ThreadedBackendError::EventFdWrite)?;
        Ok(())
    }
}

impl DecodeSession for ThreadedSession {
    fn submit(&mut self, sample: &EncodedSample, tag: SubmissionTag) -> BackendResult<()> {
        if !self.is_alive() {
            return Err(ThreadedBackendError::WorkerGone.into());
        }

        // Blocks until the worker has room for one more sample.
        self.free_slots
            .read()
            .map_err(ThreadedBackendError::EventFdRead)?;
        self.queue_job(Job::Decode(sample.clone(), tag))
    }

    fn drain(&mut self) -> BackendResult<()> {
        if !self.is_alive() {
            return Err(ThreadedBackendError::WorkerGone.into());
        }

        let done = Arc::new(
            EventFd::from_flags(EfdFlags::EFD_SEMAPHORE)
                .map_err(ThreadedBackendError::EventFdCreate)?,
        );
        self.queue_job(Job::Drain(done.clone()))?;
        done.read().map_err(ThreadedBackendError::EventFdRead)?;

        // The worker also signals pending drains when it exits.
        if lock_queue(&self.work_queue).worker_exited {
            return Err(ThreadedBackendError::WorkerGone.into());
        }

        Ok(())
    }

    fn reset(&mut self) -> BackendResult<()> {
        let abandoned = {
            let mut queue = lock_queue(&self.work_queue);
            let before = queue.jobs.len();
            queue.jobs.retain(|job| !matches!(job, Job::Decode(..)));
            before - queue.jobs.len()
        };

        log::debug!("abandoned {} queued samples", abandoned);
        if abandoned > 0 {
            self.free_slots
                .write(abandoned as u64)
                .map_err(ThreadedBackendError::EventFdWrite)?;
        }

        Ok(())
    }

    fn close(&mut self) {
        self.stopped.store(true, Ordering::Release);
        if let Err(e) = self.awaiting_job_event.write(1) {
            log::error!("failed to wake up decode worker: {}", e);
        }

        if let Some(worker_thread) = self.worker_thread.take() {
            let _ = worker_thread.join();
        }

        lock_queue(&self.work_queue).jobs.clear();
    }
}

impl Drop for ThreadedSession {
    fn drop(&mut self) {
        if self.worker_thread.is_some() {
            self.close();
        }
    }
}
