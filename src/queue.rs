//! Operation queues
//!
//! An [`OperationQueue`] runs tasks under a concurrency limit and aggregates
//! the byte counters of the members that expose them. A queue *generation*
//! begins when a task is added to an empty queue and ends when its last
//! member finishes; aggregates are reset at the start of each generation.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, Weak};
use std::thread;
use std::time::Duration;

use time::OffsetDateTime;

use crate::delegate::OperationQueueDelegate;
use crate::dispatch::{self, Job, SerialQueue};
use crate::operation::Slot;
use crate::progress::{Progress, ProgressEvent};
use crate::task::Task;

/// Concurrency limit of new queues
pub const DEFAULT_MAX_CONCURRENT_OPERATIONS: usize = 4;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Callback taking only the queue
pub type QueueCallback = Arc<dyn Fn(&OperationQueue) + Send + Sync>;
/// Callback receiving an aggregate byte count
pub type QueueBytesCallback = Arc<dyn Fn(&OperationQueue, u64) + Send + Sync>;

/// Aggregate byte counters of one queue generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueTotals {
    /// Response bytes received by all members
    pub bytes_downloaded: u64,
    /// Request bytes sent by all members
    pub bytes_uploaded: u64,
    /// `None` while any member's expected length is unknown
    pub expected_download_bytes: Option<u64>,
    /// `None` while any member's expected length is unknown
    pub expected_upload_bytes: Option<u64>,
}

impl QueueTotals {
    /// Download progress over the expected total
    pub fn download_progress(&self) -> Progress {
        Progress::from_bytes(self.bytes_downloaded, self.expected_download_bytes)
    }

    /// Upload progress over the expected total
    pub fn upload_progress(&self) -> Progress {
        Progress::from_bytes(self.bytes_uploaded, self.expected_upload_bytes)
    }
}

enum QueueEvent {
    WillStart,
    DidStart,
    DidUpload(u64),
    DidDownload(u64),
    DidMakeProgress,
    WillFinish,
    DidFinish,
}

#[derive(Default)]
struct QueueCallbacks {
    will_start: Slot<QueueCallback>,
    did_start: Slot<QueueCallback>,
    did_upload: Slot<QueueBytesCallback>,
    did_download: Slot<QueueBytesCallback>,
    did_make_progress: Slot<QueueCallback>,
    will_finish: Slot<QueueCallback>,
    did_finish: Slot<QueueCallback>,
}

/// Byte counters of a member, frozen once it finishes
#[derive(Clone, Copy)]
struct MemberBytes {
    downloaded: u64,
    uploaded: u64,
    expected_download: Option<u64>,
    expected_upload: Option<u64>,
}

impl MemberBytes {
    fn read(task: &dyn Task) -> Option<Self> {
        let source = task.progress_source()?;
        Some(Self {
            downloaded: source.bytes_downloaded(),
            uploaded: source.bytes_uploaded(),
            expected_download: source.expected_download_bytes(),
            expected_upload: source.expected_upload_bytes(),
        })
    }
}

/// A running member holds its task; a finished one keeps only its counters.
enum MemberWork {
    Live(Arc<dyn Task>),
    Done(Option<MemberBytes>),
}

struct Member {
    work: MemberWork,
    started: bool,
}

impl Member {
    fn task(&self) -> Option<&Arc<dyn Task>> {
        match &self.work {
            MemberWork::Live(task) => Some(task),
            MemberWork::Done(_) => None,
        }
    }

    fn bytes(&self) -> Option<MemberBytes> {
        match &self.work {
            MemberWork::Live(task) => MemberBytes::read(task.as_ref()),
            MemberWork::Done(bytes) => *bytes,
        }
    }
}

struct QueueState {
    max_concurrent: usize,
    generation: u64,
    next_member: u64,
    members: HashMap<u64, Member>,
    pending: VecDeque<u64>,
    running: usize,
    active: usize,
    start_date: Option<OffsetDateTime>,
    finish_date: Option<OffsetDateTime>,
}

impl QueueState {
    fn totals(&self) -> QueueTotals {
        let mut totals = QueueTotals {
            expected_download_bytes: Some(0),
            expected_upload_bytes: Some(0),
            ..QueueTotals::default()
        };
        for bytes in self.members.values().filter_map(Member::bytes) {
            totals.bytes_downloaded += bytes.downloaded;
            totals.bytes_uploaded += bytes.uploaded;
            totals.expected_download_bytes = totals
                .expected_download_bytes
                .zip(bytes.expected_download)
                .map(|(a, b)| a + b);
            totals.expected_upload_bytes = totals
                .expected_upload_bytes
                .zip(bytes.expected_upload)
                .map(|(a, b)| a + b);
        }
        totals
    }
}

/// Threads that call [`Task::start`] on behalf of the queue.
struct Pool {
    label: String,
    sender: mpsc::Sender<Arc<dyn Task>>,
    receiver: Arc<Mutex<mpsc::Receiver<Arc<dyn Task>>>>,
    threads: Mutex<usize>,
}

impl Pool {
    fn new(label: String) -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            label,
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            threads: Mutex::new(0),
        }
    }

    fn submit(&self, task: Arc<dyn Task>, limit: usize) {
        {
            let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
            if *threads < limit {
                match self.spawn_thread(*threads) {
                    Ok(()) => *threads += 1,
                    Err(e) if *threads == 0 => {
                        tracing::warn!("Failed to spawn {} worker: {}", self.label, e);
                        drop(threads);
                        task.start();
                        return;
                    }
                    Err(e) => tracing::warn!("Failed to spawn {} worker: {}", self.label, e),
                }
            }
        }
        if let Err(mpsc::SendError(task)) = self.sender.send(task) {
            task.start();
        }
    }

    fn spawn_thread(&self, index: usize) -> std::io::Result<()> {
        let receiver = Arc::clone(&self.receiver);
        thread::Builder::new()
            .name(format!("{}-worker-{}", self.label, index))
            .spawn(move || {
                loop {
                    let next = receiver
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .recv();
                    match next {
                        Ok(task) => task.start(),
                        Err(_) => break,
                    }
                }
            })?;
        Ok(())
    }
}

/// Runs tasks under a concurrency limit and aggregates their progress.
///
/// ```rust,no_run
/// use ferry::{HttpOperation, OperationQueue};
///
/// # fn main() -> ferry::Result<()> {
/// let queue = OperationQueue::new();
/// queue.on_did_finish(|queue| println!("{} bytes", queue.bytes_downloaded()));
/// for path in ["a", "b", "c"] {
///     let op = HttpOperation::builder(&format!("https://example.com/{}", path))?.build()?;
///     queue.add(op);
/// }
/// queue.wait_until_all_operations_are_finished();
/// # Ok(())
/// # }
/// ```
pub struct OperationQueue {
    this: Weak<OperationQueue>,
    id: String,
    state: Mutex<QueueState>,
    idle: Condvar,
    pool: Pool,
    delegate: RwLock<Option<Arc<dyn OperationQueueDelegate>>>,
    callbacks: QueueCallbacks,
    on_main_queue: AtomicBool,
    dispatch: SerialQueue,
}

impl OperationQueue {
    /// A queue running at most four tasks at a time
    pub fn new() -> Arc<Self> {
        let id = format!("ferry-queue-{}", NEXT_ID.fetch_add(1, Ordering::Relaxed));
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            state: Mutex::new(QueueState {
                max_concurrent: DEFAULT_MAX_CONCURRENT_OPERATIONS,
                generation: 0,
                next_member: 0,
                members: HashMap::new(),
                pending: VecDeque::new(),
                running: 0,
                active: 0,
                start_date: None,
                finish_date: None,
            }),
            idle: Condvar::new(),
            pool: Pool::new(id.clone()),
            dispatch: SerialQueue::new(format!("{}-events", id)),
            delegate: RwLock::new(None),
            callbacks: QueueCallbacks::default(),
            on_main_queue: AtomicBool::new(false),
            id,
        })
    }

    /// The process-wide queue
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<OperationQueue>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(OperationQueue::new))
    }

    /// Process-unique identifier, `ferry-queue-<n>`
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Enqueue `task`; it starts once a slot under the limit is free.
    pub fn add<T: Task>(&self, task: Arc<T>) {
        let task: Arc<dyn Task> = task;
        let (member, generation, starting) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let starting = state.active == 0;
            if starting {
                state.generation += 1;
                state.members.clear();
                state.start_date = Some(OffsetDateTime::now_utc());
                state.finish_date = None;
            }
            let member = state.next_member;
            state.next_member += 1;
            state.active += 1;
            state.members.insert(
                member,
                Member {
                    work: MemberWork::Live(Arc::clone(&task)),
                    started: false,
                },
            );
            state.pending.push_back(member);
            (member, state.generation, starting)
        };

        if starting {
            tracing::debug!("Queue {} generation {} starting", self.id, generation);
            self.post(QueueEvent::WillStart);
            self.post(QueueEvent::DidStart);
        }

        if let Some(source) = task.progress_source() {
            let queue = self.this.clone();
            source.add_progress_listener(Arc::new(move |event| {
                if let Some(queue) = queue.upgrade() {
                    queue.member_progressed(generation, event);
                }
            }));
        }

        let queue = self.this.clone();
        task.task_state().on_finished(move || {
            if let Some(queue) = queue.upgrade() {
                queue.member_finished(member);
            }
        });

        self.schedule();
    }

    /// Tasks added in this generation that have not finished
    pub fn operation_count(&self) -> usize {
        self.lock().active
    }

    /// Most members allowed to run at once
    pub fn max_concurrent_operation_count(&self) -> usize {
        self.lock().max_concurrent
    }

    /// Change the limit; values below one are raised to one.
    pub fn set_max_concurrent_operation_count(&self, count: usize) {
        self.lock().max_concurrent = count.max(1);
        self.schedule();
    }

    /// Cancel every unfinished member.
    pub fn cancel_all_operations(&self) {
        let tasks: Vec<_> = self
            .lock()
            .members
            .values()
            .filter_map(Member::task)
            .cloned()
            .collect();
        tracing::debug!("Queue {} cancelling {} operations", self.id, tasks.len());
        for task in tasks {
            task.cancel();
        }
    }

    /// Block until every added task has finished.
    pub fn wait_until_all_operations_are_finished(&self) {
        let mut state = self.lock();
        while state.active > 0 {
            state = self
                .idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Aggregate counters, summed over this generation's members now
    pub fn totals(&self) -> QueueTotals {
        self.lock().totals()
    }

    /// Response bytes received in this generation
    pub fn bytes_downloaded(&self) -> u64 {
        self.totals().bytes_downloaded
    }

    /// Request bytes sent in this generation
    pub fn bytes_uploaded(&self) -> u64 {
        self.totals().bytes_uploaded
    }

    /// `None` while any member's download length is unknown
    pub fn expected_download_bytes(&self) -> Option<u64> {
        self.totals().expected_download_bytes
    }

    /// `None` while any member's upload length is unknown
    pub fn expected_upload_bytes(&self) -> Option<u64> {
        self.totals().expected_upload_bytes
    }

    /// Aggregate download progress
    pub fn download_progress(&self) -> Progress {
        self.totals().download_progress()
    }

    /// Aggregate upload progress
    pub fn upload_progress(&self) -> Progress {
        self.totals().upload_progress()
    }

    /// When the current or last generation started
    pub fn start_date(&self) -> Option<OffsetDateTime> {
        self.lock().start_date
    }

    /// When the last generation finished; `None` while one is running
    pub fn finish_date(&self) -> Option<OffsetDateTime> {
        self.lock().finish_date
    }

    /// Duration of the current or last generation
    pub fn elapsed(&self) -> Option<Duration> {
        let state = self.lock();
        let start = state.start_date?;
        let end = state.finish_date.unwrap_or_else(OffsetDateTime::now_utc);
        Some(Duration::try_from(end - start).unwrap_or_default())
    }

    /// Observer notified before each callback
    pub fn delegate(&self) -> Option<Arc<dyn OperationQueueDelegate>> {
        self.delegate
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the observer
    pub fn set_delegate(&self, delegate: Option<Arc<dyn OperationQueueDelegate>>) {
        *self.delegate.write().unwrap_or_else(PoisonError::into_inner) = delegate;
    }

    /// Whether queue notifications go to the main queue
    pub fn performs_callbacks_on_main_queue(&self) -> bool {
        self.on_main_queue.load(Ordering::Acquire)
    }

    /// Deliver queue notifications on the main queue
    pub fn set_performs_callbacks_on_main_queue(&self, on_main_queue: bool) {
        self.on_main_queue.store(on_main_queue, Ordering::Release);
    }

    /// Called when a generation is about to start
    pub fn on_will_start<F>(&self, f: F)
    where
        F: Fn(&OperationQueue) + Send + Sync + 'static,
    {
        self.callbacks.will_start.set(Some(Arc::new(f)));
    }

    /// Called when a generation started
    pub fn on_did_start<F>(&self, f: F)
    where
        F: Fn(&OperationQueue) + Send + Sync + 'static,
    {
        self.callbacks.did_start.set(Some(Arc::new(f)));
    }

    /// Called with the generation's total bytes uploaded
    pub fn on_did_upload<F>(&self, f: F)
    where
        F: Fn(&OperationQueue, u64) + Send + Sync + 'static,
    {
        self.callbacks.did_upload.set(Some(Arc::new(f)));
    }

    /// Called with the generation's total bytes downloaded
    pub fn on_did_download<F>(&self, f: F)
    where
        F: Fn(&OperationQueue, u64) + Send + Sync + 'static,
    {
        self.callbacks.did_download.set(Some(Arc::new(f)));
    }

    /// Called after every upload or download total
    pub fn on_did_make_progress<F>(&self, f: F)
    where
        F: Fn(&OperationQueue) + Send + Sync + 'static,
    {
        self.callbacks.did_make_progress.set(Some(Arc::new(f)));
    }

    /// Called when the generation's last member finished
    pub fn on_will_finish<F>(&self, f: F)
    where
        F: Fn(&OperationQueue) + Send + Sync + 'static,
    {
        self.callbacks.will_finish.set(Some(Arc::new(f)));
    }

    /// Final event of a generation
    pub fn on_did_finish<F>(&self, f: F)
    where
        F: Fn(&OperationQueue) + Send + Sync + 'static,
    {
        self.callbacks.did_finish.set(Some(Arc::new(f)));
    }

    fn schedule(&self) {
        let (ready, limit) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let mut ready = Vec::new();
            while state.running < state.max_concurrent {
                let Some(id) = state.pending.pop_front() else {
                    break;
                };
                let Some(member) = state.members.get_mut(&id) else {
                    continue;
                };
                let Some(task) = member.task().cloned() else {
                    continue;
                };
                member.started = true;
                state.running += 1;
                ready.push(task);
            }
            (ready, state.max_concurrent)
        };

        for task in ready {
            self.pool.submit(task, limit);
        }
    }

    fn member_progressed(&self, generation: u64, event: ProgressEvent) {
        let totals = {
            let state = self.lock();
            if state.generation != generation || state.active == 0 {
                return;
            }
            state.totals()
        };
        match event {
            ProgressEvent::Upload => self.post(QueueEvent::DidUpload(totals.bytes_uploaded)),
            ProgressEvent::Download => self.post(QueueEvent::DidDownload(totals.bytes_downloaded)),
        }
        self.post(QueueEvent::DidMakeProgress);
    }

    fn member_finished(&self, id: u64) {
        let finished_generation = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let Some(member) = state.members.get_mut(&id) else {
                return;
            };
            let bytes = match member.task() {
                Some(task) => MemberBytes::read(task.as_ref()),
                None => return,
            };
            member.work = MemberWork::Done(bytes);
            if member.started {
                state.running -= 1;
            } else {
                state.pending.retain(|pending| *pending != id);
            }
            state.active -= 1;
            if state.active == 0 {
                state.finish_date = Some(OffsetDateTime::now_utc());
                Some(state.generation)
            } else {
                None
            }
        };

        match finished_generation {
            Some(generation) => {
                tracing::debug!(
                    "Queue {} generation {} finished after {:?}",
                    self.id,
                    generation,
                    self.elapsed().unwrap_or_default()
                );
                self.post(QueueEvent::WillFinish);
                self.post(QueueEvent::DidFinish);
                self.idle.notify_all();
            }
            None => self.schedule(),
        }
    }

    fn post(&self, event: QueueEvent) {
        let Some(queue) = self.this.upgrade() else {
            return;
        };
        let job: Job = Box::new(move || queue.deliver(event));
        if self.performs_callbacks_on_main_queue() {
            dispatch::main_queue().dispatch(job);
        } else {
            self.dispatch.dispatch(job);
        }
    }

    fn deliver(&self, event: QueueEvent) {
        let delegate = self.delegate();
        let delegate = delegate.as_deref();
        let callbacks = &self.callbacks;

        match event {
            QueueEvent::WillStart => {
                if let Some(delegate) = delegate {
                    delegate.will_start(self);
                }
                if let Some(f) = callbacks.will_start.get() {
                    f(self);
                }
            }
            QueueEvent::DidStart => {
                if let Some(delegate) = delegate {
                    delegate.did_start(self);
                }
                if let Some(f) = callbacks.did_start.get() {
                    f(self);
                }
            }
            QueueEvent::DidUpload(bytes) => {
                if let Some(delegate) = delegate {
                    delegate.did_upload(self, bytes);
                }
                if let Some(f) = callbacks.did_upload.get() {
                    f(self, bytes);
                }
            }
            QueueEvent::DidDownload(bytes) => {
                if let Some(delegate) = delegate {
                    delegate.did_download(self, bytes);
                }
                if let Some(f) = callbacks.did_download.get() {
                    f(self, bytes);
                }
            }
            QueueEvent::DidMakeProgress => {
                if let Some(delegate) = delegate {
                    delegate.did_make_progress(self);
                }
                if let Some(f) = callbacks.did_make_progress.get() {
                    f(self);
                }
            }
            QueueEvent::WillFinish => {
                if let Some(delegate) = delegate {
                    delegate.will_finish(self);
                }
                if let Some(f) = callbacks.will_finish.get() {
                    f(self);
                }
            }
            QueueEvent::DidFinish => {
                if let Some(delegate) = delegate {
                    delegate.did_finish(self);
                }
                if let Some(f) = callbacks.did_finish.get() {
                    f(self);
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("OperationQueue")
            .field("id", &self.id)
            .field("generation", &state.generation)
            .field("active", &state.active)
            .field("running", &state.running)
            .field("max_concurrent", &state.max_concurrent)
            .finish()
    }
}
