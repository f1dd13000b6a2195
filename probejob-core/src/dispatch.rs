//! Job dispatch.
//!
//! A [`Dispatcher`] owns a pool of worker threads that run the execute phase
//! of submitted jobs, and delivers progress and completion callbacks on the
//! thread that owns the dispatcher. Callbacks are only invoked from
//! [`Dispatcher::poll`], [`Dispatcher::wait`] and [`Dispatcher::run_until_idle`].
//!
//! ```no_run
//! use probejob_core::{Dispatcher, DispatcherConfig, Job, MockDriver};
//!
//! let mut dispatcher = Dispatcher::new(MockDriver::new(), DispatcherConfig::default());
//! let id = dispatcher.submit(Job::read(0x1000, 4).unwrap(), |result| {
//!     println!("read finished: {result:?}");
//! });
//! dispatcher.wait(id);
//! ```

use crate::driver::Driver;
use crate::error::{JobError, LowLevelError, ResetOutcome, ResultCode};
use crate::flash::{Progress, ProgressUpdate};
use crate::job::{panic_message, ExecutedJob, Job, JobId, JobResponse};
use crate::lock::{ExecutionMutex, DEFAULT_LOCK_TIMEOUT};
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::broadcast;

/// Dispatcher settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Number of worker threads running execute phases.
    pub workers: usize,
    /// Bound on how long a job waits for exclusive probe access.
    #[serde(rename = "lock_timeout_ms", with = "duration_ms")]
    pub lock_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { workers: 4, lock_timeout: DEFAULT_LOCK_TIMEOUT }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Lifecycle notifications, broadcast to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Submitted { id: JobId, operation: &'static str },
    Started { id: JobId, operation: &'static str },
    Progress { id: JobId, update: ProgressUpdate },
    Finished { id: JobId, operation: &'static str, result: ResultCode, elapsed: Duration },
}

type CompletionCallback = Box<dyn FnOnce(Result<JobResponse, JobError>)>;
type ProgressCallback = Box<dyn FnMut(&ProgressUpdate)>;

struct Pending {
    on_progress: Option<ProgressCallback>,
    on_complete: CompletionCallback,
}

struct Work {
    id: JobId,
    job: Job,
}

/// Sent from a worker to the calling thread. A job's notices travel on one
/// FIFO channel, so its progress always arrives before its completion.
enum Notice {
    Progress(ProgressUpdate),
    Done(ExecutedJob),
    /// The job never produced an executed state.
    Aborted(JobError),
}

/// Runs jobs on a worker pool and hands results back to the owning thread.
pub struct Dispatcher<D: Driver> {
    work_tx: Option<Sender<Work>>,
    notice_tx: Sender<(JobId, Notice)>,
    notice_rx: Receiver<(JobId, Notice)>,
    workers: Vec<thread::JoinHandle<()>>,
    mutex: Arc<ExecutionMutex<D>>,
    event_tx: broadcast::Sender<JobEvent>,
    pending: HashMap<JobId, Pending>,
    next_id: u64,
}

impl<D: Driver> Dispatcher<D> {
    pub fn new(driver: D, config: DispatcherConfig) -> Self {
        Self::with_mutex(Arc::new(ExecutionMutex::new(driver, config.lock_timeout)), config)
    }

    /// Dispatch through an existing execution mutex, shared with other
    /// dispatchers. The mutex keeps its own timeout.
    pub fn with_mutex(mutex: Arc<ExecutionMutex<D>>, config: DispatcherConfig) -> Self {
        let (work_tx, work_rx) = crossbeam_channel::unbounded::<Work>();
        let (notice_tx, notice_rx) = crossbeam_channel::unbounded();
        let (event_tx, _) = broadcast::channel(100);

        let workers = (0..config.workers.max(1))
            .map(|n| {
                let work_rx = work_rx.clone();
                let notice_tx = notice_tx.clone();
                let event_tx = event_tx.clone();
                let mutex = Arc::clone(&mutex);
                thread::Builder::new()
                    .name(format!("probejob-worker-{n}"))
                    .spawn(move || worker_loop(&work_rx, &notice_tx, &event_tx, &mutex))
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    log::error!("Failed to spawn worker thread: {e}");
                    None
                }
            })
            .collect::<Vec<_>>();
        if workers.is_empty() {
            log::error!("No worker thread could be started, every job will fail");
        } else {
            log::debug!("Dispatcher started with {} workers", workers.len());
        }

        Self {
            work_tx: Some(work_tx),
            notice_tx,
            notice_rx,
            workers,
            mutex,
            event_tx,
            pending: HashMap::new(),
            next_id: 0,
        }
    }

    /// The execution mutex guarding this dispatcher's driver.
    pub const fn mutex(&self) -> &Arc<ExecutionMutex<D>> {
        &self.mutex
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.event_tx.subscribe()
    }

    /// Number of submitted jobs whose completion has not been delivered yet.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Submit a job. Returns immediately; `on_complete` runs exactly once,
    /// on this thread, from a later `poll`, `wait` or `run_until_idle`.
    pub fn submit(&mut self, job: Job, on_complete: impl FnOnce(Result<JobResponse, JobError>) + 'static) -> JobId {
        self.enqueue(job, None, Box::new(on_complete))
    }

    /// Submit a job that may report progress. `on_progress` is called for
    /// each update, in order, before `on_complete`.
    pub fn submit_with_progress(
        &mut self,
        job: Job,
        on_progress: impl FnMut(&ProgressUpdate) + 'static,
        on_complete: impl FnOnce(Result<JobResponse, JobError>) + 'static,
    ) -> JobId {
        self.enqueue(job, Some(Box::new(on_progress)), Box::new(on_complete))
    }

    /// Submit a job and block until its result is available.
    pub fn run(&mut self, job: Job) -> Result<JobResponse, JobError> {
        let slot = Rc::new(RefCell::new(None));
        let id = {
            let slot = Rc::clone(&slot);
            self.submit(job, move |result| *slot.borrow_mut() = Some(result))
        };
        self.wait(id);
        let result = slot.borrow_mut().take();
        result.unwrap_or_else(|| unreachable!("job {id} was waited for but never completed"))
    }

    /// Deliver every notice that is already available. Returns the number of
    /// completions delivered.
    pub fn poll(&mut self) -> usize {
        let mut completed = 0;
        while let Ok((id, notice)) = self.notice_rx.try_recv() {
            completed += usize::from(self.deliver(id, notice));
        }
        completed
    }

    /// Block until the completion of `id` has been delivered. Notices of
    /// other jobs that arrive meanwhile are delivered too.
    pub fn wait(&mut self, id: JobId) {
        while self.pending.contains_key(&id) {
            match self.notice_rx.recv() {
                Ok((from, notice)) => {
                    self.deliver(from, notice);
                }
                Err(_) => break,
            }
        }
    }

    /// Block until every submitted job has completed.
    pub fn run_until_idle(&mut self) {
        while !self.pending.is_empty() {
            match self.notice_rx.recv() {
                Ok((from, notice)) => {
                    self.deliver(from, notice);
                }
                Err(_) => break,
            }
        }
    }

    fn enqueue(&mut self, job: Job, on_progress: Option<ProgressCallback>, on_complete: CompletionCallback) -> JobId {
        let id = JobId(self.next_id);
        self.next_id += 1;
        let operation = job.name();

        self.pending.insert(id, Pending { on_progress, on_complete });
        let _ = self.event_tx.send(JobEvent::Submitted { id, operation });
        log::debug!("Submitted {operation} as job {id}");

        let sent = self.work_tx.as_ref().map(|tx| tx.send(Work { id, job }));
        if !matches!(sent, Some(Ok(()))) {
            log::error!("No worker accepted job {id}");
            // Delivered from the next poll like any other completion.
            let _ = self.notice_tx.send((id, Notice::Aborted(internal_failure(operation))));
        }
        id
    }

    /// Hand one notice to its callbacks. Returns whether a job completed.
    fn deliver(&mut self, id: JobId, notice: Notice) -> bool {
        match notice {
            Notice::Progress(update) => {
                if let Some(callback) = self.pending.get_mut(&id).and_then(|p| p.on_progress.as_mut()) {
                    callback(&update);
                }
                false
            }
            Notice::Done(executed) => match self.pending.remove(&id) {
                Some(pending) => {
                    (pending.on_complete)(executed.complete());
                    true
                }
                None => false,
            },
            Notice::Aborted(error) => match self.pending.remove(&id) {
                Some(pending) => {
                    (pending.on_complete)(Err(error));
                    true
                }
                None => false,
            },
        }
    }
}

impl<D: Driver> Drop for Dispatcher<D> {
    fn drop(&mut self) {
        self.work_tx.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("Worker thread panicked");
            }
        }
        if !self.pending.is_empty() {
            log::warn!("Dispatcher dropped with {} undelivered completions", self.pending.len());
        }
    }
}

impl<D: Driver> std::fmt::Debug for Dispatcher<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("workers", &self.workers.len())
            .field("pending", &self.pending.len())
            .field("mutex", &self.mutex)
            .finish()
    }
}

fn worker_loop<D: Driver>(
    work_rx: &Receiver<Work>,
    notice_tx: &Sender<(JobId, Notice)>,
    event_tx: &broadcast::Sender<JobEvent>,
    mutex: &ExecutionMutex<D>,
) {
    for Work { id, job } in work_rx.iter() {
        let operation = job.name();
        let _ = event_tx.send(JobEvent::Started { id, operation });

        let progress = if job.may_have_progress() {
            let notice_tx = notice_tx.clone();
            let event_tx = event_tx.clone();
            Progress::new(operation, move |update| {
                let _ = event_tx.send(JobEvent::Progress { id, update: update.clone() });
                let _ = notice_tx.send((id, Notice::Progress(update)));
            })
        } else {
            Progress::disabled(operation)
        };

        let notice = match panic::catch_unwind(AssertUnwindSafe(|| job.execute(mutex, &progress))) {
            Ok(executed) => {
                let _ = event_tx.send(JobEvent::Finished {
                    id,
                    operation,
                    result: executed.job().state().result,
                    elapsed: executed.elapsed(),
                });
                Notice::Done(executed)
            }
            Err(payload) => {
                log::error!("Execute phase of {operation} ({id}) panicked: {}", panic_message(&*payload));
                let error = internal_failure(operation);
                let result = error.result();
                let _ = event_tx.send(JobEvent::Finished { id, operation, result, elapsed: Duration::ZERO });
                Notice::Aborted(error)
            }
        };
        if notice_tx.send((id, notice)).is_err() {
            break;
        }
    }
}

fn internal_failure(operation: &'static str) -> JobError {
    JobError::Failed {
        operation,
        result: ResultCode::CouldNotCallFunction,
        lowlevel: Some(LowLevelError::InternalError),
        reset: ResetOutcome::NotRequired,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockDriver;

    #[test]
    fn test_config_json_uses_milliseconds() {
        let config: DispatcherConfig = serde_json::from_str(r#"{"workers": 2, "lock_timeout_ms": 250}"#).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.lock_timeout, Duration::from_millis(250));

        let defaults: DispatcherConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(defaults, DispatcherConfig::default());

        let json = serde_json::to_value(DispatcherConfig::default()).unwrap();
        assert_eq!(json["lock_timeout_ms"], 10_000);
    }

    #[test]
    fn test_run_returns_result() {
        let mut dispatcher = Dispatcher::new(MockDriver::new(), DispatcherConfig::default());
        let response = dispatcher.run(Job::library_version()).unwrap();
        assert_eq!(response.operation, "get library version");
        assert_eq!(response.values.len(), 1);
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn test_callbacks_only_run_when_pumped() {
        let mut dispatcher = Dispatcher::new(MockDriver::new(), DispatcherConfig::default());
        let done = Rc::new(RefCell::new(false));
        let id = {
            let done = Rc::clone(&done);
            dispatcher.submit(Job::reset(), move |_| *done.borrow_mut() = true)
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!*done.borrow());
        dispatcher.wait(id);
        assert!(*done.borrow());
    }

    #[test]
    fn test_driver_panic_completes_job_with_error() {
        let mut driver = MockDriver::new();
        driver.panic_on("read");
        let mut dispatcher = Dispatcher::new(driver, DispatcherConfig { workers: 1, ..Default::default() });

        let results = Rc::new(RefCell::new(Vec::new()));
        let id = {
            let results = Rc::clone(&results);
            dispatcher.submit(Job::read(0x1000, 4).unwrap(), move |r| results.borrow_mut().push(r))
        };
        let waited = panic::catch_unwind(AssertUnwindSafe(|| dispatcher.wait(id)));
        assert!(waited.is_ok());
        assert_eq!(dispatcher.pending(), 0);

        let results = results.borrow();
        assert_eq!(results.len(), 1);
        let err = results[0].clone().unwrap_err();
        assert_eq!(err.result(), ResultCode::CouldNotCallFunction);
        assert_eq!(err.lowlevel(), Some(LowLevelError::InternalError));

        // The worker survives and the probe was released.
        assert!(dispatcher.run(Job::reset()).is_ok());
    }

    #[test]
    fn test_unaccepted_job_still_completes() {
        let mut dispatcher = Dispatcher::new(MockDriver::new(), DispatcherConfig { workers: 1, ..Default::default() });
        dispatcher.work_tx.take();

        let calls = Rc::new(RefCell::new(0));
        let id = {
            let calls = Rc::clone(&calls);
            dispatcher.submit(Job::reset(), move |r| {
                assert!(r.is_err());
                *calls.borrow_mut() += 1;
            })
        };
        assert_eq!(*calls.borrow(), 0);
        dispatcher.wait(id);
        assert_eq!(*calls.borrow(), 1);
        assert_eq!(dispatcher.pending(), 0);
        assert!(dispatcher.run(Job::reset()).is_err());
    }
}
