//! Shared batch OCR scheduler.
//!
//! Accepts task groups from any number of concurrent extractor invocations
//! and executes them through one worker pool, so engine initialization is
//! amortized across files instead of paid per PDF. Workers are OS threads
//! holding one lazily created engine each; extractors communicate with them
//! only through the scheduler's queue and per-group completion channels.
//!
//! Group lifecycle: REGISTERED → DISPATCHED → COMPLETED. `await_group`
//! consumes the completed result; later calls (and unknown ids) return an
//! empty list.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;
use tokio::sync::oneshot;

use super::log::{OcrLog, OcrLogRecord};
use super::resources::ResourceController;
use super::{assemble_text, OcrEngine, OcrEngineFactory, OcrTask};
use crate::config::OcrConfig;

/// Per-run scheduler counters.
#[derive(Debug, Default, Clone, Serialize)]
pub struct OcrStats {
    pub pages_processed: u64,
    pub wall_secs: f64,
    pub failures: u64,
    pub engine_inits: u64,
    pub engine_init_failures: u64,
}

impl OcrStats {
    pub fn pages_per_second(&self) -> f64 {
        if self.wall_secs > 0.0 {
            self.pages_processed as f64 / self.wall_secs
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupState {
    Registered,
    Dispatched,
    Completed,
}

struct GroupEntry {
    source: String,
    expected: usize,
    pages: Vec<usize>,
    results: Vec<(usize, String)>,
    failures: usize,
    state: GroupState,
    submitted_at: Instant,
    done_tx: Option<oneshot::Sender<Vec<(usize, String)>>>,
}

struct QueuedTask {
    group: String,
    page_index: usize,
    image: Vec<u8>,
}

struct SchedState {
    queue: VecDeque<QueuedTask>,
    groups: HashMap<String, GroupEntry>,
    shutdown: bool,
    active_workers: usize,
    batch_remaining: usize,
    paused_until: Option<Instant>,
    stats: OcrStats,
    last_init_error: Option<String>,
}

struct Shared {
    state: Mutex<SchedState>,
    task_ready: Condvar,
    space_ready: tokio::sync::Notify,
    factory: Arc<dyn OcrEngineFactory>,
    controller: ResourceController,
    log: Option<OcrLog>,
    languages: Vec<String>,
    batch_pages: usize,
    queue_cap: usize,
}

pub struct OcrScheduler {
    shared: Arc<Shared>,
    receivers: Mutex<HashMap<String, oneshot::Receiver<Vec<(usize, String)>>>>,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
    serial: AtomicBool,
    serial_engine: tokio::sync::Mutex<Option<Box<dyn OcrEngine>>>,
    group_timeout: Duration,
    workers: usize,
}

impl OcrScheduler {
    /// Build the scheduler and start its worker pool. The pool size is
    /// `min(core count, config.max_workers)`; in serial mode (configured or
    /// forced by thread-spawn failure) no threads are started and tasks run
    /// in-process with the same contract.
    pub fn new(
        config: &OcrConfig,
        factory: Arc<dyn OcrEngineFactory>,
        controller: ResourceController,
        log: Option<OcrLog>,
    ) -> Self {
        let workers = num_cpus::get().min(config.max_workers).max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(SchedState {
                queue: VecDeque::new(),
                groups: HashMap::new(),
                shutdown: false,
                active_workers: workers,
                batch_remaining: 0,
                paused_until: None,
                stats: OcrStats::default(),
                last_init_error: None,
            }),
            task_ready: Condvar::new(),
            space_ready: tokio::sync::Notify::new(),
            factory,
            controller,
            log,
            languages: config.languages.clone(),
            batch_pages: config.batch_pages,
            queue_cap: config.queue_cap,
        });

        let scheduler = Self {
            shared,
            receivers: Mutex::new(HashMap::new()),
            handles: Mutex::new(Vec::new()),
            serial: AtomicBool::new(config.serial),
            serial_engine: tokio::sync::Mutex::new(None),
            group_timeout: Duration::from_secs(config.group_timeout_secs),
            workers,
        };

        if !scheduler.serial.load(Ordering::SeqCst) {
            let mut handles = scheduler.handles.lock().unwrap();
            for index in 0..workers {
                let shared = scheduler.shared.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("ocr-worker-{index}"))
                    .spawn(move || worker_loop(shared, index));
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(_) => break,
                }
            }
            if handles.is_empty() {
                scheduler.serial.store(true, Ordering::SeqCst);
            }
        }

        scheduler
    }

    /// Append a group's tasks to the global queue. Blocks (asynchronously)
    /// while the queue is over its soft cap, which bounds the memory held by
    /// rasterized page images.
    pub async fn submit_group(
        &self,
        group_id: &str,
        source: &str,
        tasks: Vec<OcrTask>,
    ) -> Result<()> {
        let mut seen = HashSet::new();
        for task in &tasks {
            if !seen.insert(task.page_index) {
                anyhow::bail!(
                    "duplicate page index {} in group {}",
                    task.page_index,
                    group_id
                );
            }
        }

        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.groups.contains_key(group_id) {
                anyhow::bail!("task group {} already registered", group_id);
            }
            let mut entry = GroupEntry {
                source: source.to_string(),
                expected: tasks.len(),
                pages: tasks.iter().map(|t| t.page_index).collect(),
                results: Vec::new(),
                failures: 0,
                state: GroupState::Registered,
                submitted_at: Instant::now(),
                done_tx: Some(done_tx),
            };
            if tasks.is_empty() {
                entry.state = GroupState::Completed;
                if let Some(tx) = entry.done_tx.take() {
                    let _ = tx.send(Vec::new());
                }
            } else {
                state.groups.insert(group_id.to_string(), entry);
            }
        }
        self.receivers
            .lock()
            .unwrap()
            .insert(group_id.to_string(), done_rx);

        for task in tasks {
            let queued = QueuedTask {
                group: group_id.to_string(),
                page_index: task.page_index,
                image: task.image,
            };
            let mut queued = Some(queued);
            loop {
                let notified = self.shared.space_ready.notified();
                {
                    let mut state = self.shared.state.lock().unwrap();
                    if state.queue.len() < self.shared.queue_cap {
                        state.queue.push_back(queued.take().unwrap());
                        self.shared.task_ready.notify_all();
                        break;
                    }
                }
                if self.serial.load(Ordering::SeqCst) {
                    // No workers to make room; drain in-process instead.
                    self.drain_serial().await;
                } else {
                    notified.await;
                }
            }
        }
        Ok(())
    }

    /// Block until every task of the group has been processed and return its
    /// results sorted by page index. The result is consumed: a second call
    /// for the same id, or a call for an unknown id, returns an empty list.
    ///
    /// A group that outlives the soft timeout is abandoned: pages without a
    /// result are returned with empty text and a diagnostic is logged.
    pub async fn await_group(&self, group_id: &str) -> Vec<(usize, String)> {
        if self.serial.load(Ordering::SeqCst) {
            self.drain_serial().await;
        }

        let rx = self.receivers.lock().unwrap().remove(group_id);
        let Some(rx) = rx else {
            return Vec::new();
        };

        match tokio::time::timeout(self.group_timeout, rx).await {
            Ok(Ok(results)) => results,
            Ok(Err(_)) => Vec::new(),
            Err(_) => self.abandon_group(group_id),
        }
    }

    /// Drain all pending groups.
    pub async fn flush(&self) {
        loop {
            if self.serial.load(Ordering::SeqCst) {
                self.drain_serial().await;
            }
            {
                let state = self.shared.state.lock().unwrap();
                if state.queue.is_empty() && state.groups.is_empty() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Drain pending work and tear down the worker pool.
    pub async fn shutdown(&self) {
        self.flush().await;
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            self.shared.task_ready.notify_all();
        }
        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    pub fn stats(&self) -> OcrStats {
        self.shared.state.lock().unwrap().stats.clone()
    }

    pub fn last_init_error(&self) -> Option<String> {
        self.shared.state.lock().unwrap().last_init_error.clone()
    }

    pub fn worker_count(&self) -> usize {
        if self.serial.load(Ordering::SeqCst) {
            1
        } else {
            self.workers
        }
    }

    fn abandon_group(&self, group_id: &str) -> Vec<(usize, String)> {
        let mut state = self.shared.state.lock().unwrap();
        let Some(entry) = state.groups.remove(group_id) else {
            return Vec::new();
        };
        state.queue.retain(|t| t.group != group_id);
        self.shared.space_ready.notify_waiters();

        let mut results = entry.results;
        let have: HashSet<usize> = results.iter().map(|r| r.0).collect();
        let mut timed_out = 0u64;
        for page in &entry.pages {
            if !have.contains(page) {
                results.push((*page, String::new()));
                timed_out += 1;
            }
        }
        results.sort_by_key(|r| r.0);
        state.stats.failures += timed_out;
        drop(state);

        if let Some(log) = &self.shared.log {
            log.append(
                &OcrLogRecord::new(
                    &entry.source,
                    entry.expected,
                    entry.submitted_at.elapsed().as_secs_f64(),
                )
                .failed("OCR_TIMEOUT"),
            );
        }
        results
    }

    /// Serial execution path: identical contract, no worker threads. The
    /// single engine handle lives for the scheduler's lifetime.
    async fn drain_serial(&self) {
        loop {
            let task = {
                let mut state = self.shared.state.lock().unwrap();
                loop {
                    match state.queue.pop_front() {
                        Some(task) if state.groups.contains_key(&task.group) => break Some(task),
                        Some(_) => continue,
                        None => break None,
                    }
                }
            };
            let Some(task) = task else {
                return;
            };
            self.shared.space_ready.notify_one();

            let mut engine_slot = self.serial_engine.lock().await;
            if engine_slot.is_none() {
                match self.shared.factory.create() {
                    Ok(engine) => {
                        *engine_slot = Some(engine);
                        let mut state = self.shared.state.lock().unwrap();
                        state.stats.engine_inits += 1;
                    }
                    Err(e) => {
                        record_init_failure(&self.shared, &e.to_string());
                        complete_task(
                            &self.shared,
                            &task.group,
                            task.page_index,
                            String::new(),
                            true,
                            Duration::ZERO,
                        );
                        continue;
                    }
                }
            }

            let mut engine = engine_slot.take().unwrap();
            let languages = self.shared.languages.clone();
            let image = task.image;
            let outcome = tokio::task::spawn_blocking(move || {
                let started = Instant::now();
                let result = engine.recognize(&image, &languages);
                (engine, result, started.elapsed())
            })
            .await;

            match outcome {
                Ok((engine, result, elapsed)) => {
                    *engine_slot = Some(engine);
                    let (text, failed) = match result {
                        Ok(lines) => (assemble_text(&lines), false),
                        Err(_) => (String::new(), true),
                    };
                    complete_task(
                        &self.shared,
                        &task.group,
                        task.page_index,
                        text,
                        failed,
                        elapsed,
                    );
                }
                Err(_) => {
                    complete_task(
                        &self.shared,
                        &task.group,
                        task.page_index,
                        String::new(),
                        true,
                        Duration::ZERO,
                    );
                }
            }
        }
    }
}

fn record_init_failure(shared: &Shared, reason: &str) {
    let mut state = shared.state.lock().unwrap();
    state.stats.engine_init_failures += 1;
    state.last_init_error = Some(reason.to_string());
}

/// Record one finished page; on group completion, deliver the sorted
/// results and write the OCR log record.
fn complete_task(
    shared: &Shared,
    group_id: &str,
    page_index: usize,
    text: String,
    failed: bool,
    elapsed: Duration,
) {
    let finished = {
        let mut state = shared.state.lock().unwrap();
        state.stats.pages_processed += 1;
        state.stats.wall_secs += elapsed.as_secs_f64();
        if failed {
            state.stats.failures += 1;
        }
        let mut finished = None;
        if let Some(entry) = state.groups.get_mut(group_id) {
            debug_assert!(entry.state != GroupState::Completed);
            entry.results.push((page_index, text));
            if failed {
                entry.failures += 1;
            }
            if entry.results.len() == entry.expected {
                entry.state = GroupState::Completed;
                let mut entry = state.groups.remove(group_id).unwrap();
                entry.results.sort_by_key(|r| r.0);
                if let Some(tx) = entry.done_tx.take() {
                    let _ = tx.send(entry.results.clone());
                }
                finished = Some(entry);
            }
        }
        finished
    };

    if let (Some(entry), Some(log)) = (finished, shared.log.as_ref()) {
        let record = OcrLogRecord::new(
            &entry.source,
            entry.expected,
            entry.submitted_at.elapsed().as_secs_f64(),
        );
        if entry.failures > 0 {
            log.append(&record.failed(format!("{} page(s) failed", entry.failures)));
        } else {
            log.append(&record);
        }
    }
}

fn worker_loop(shared: Arc<Shared>, index: usize) {
    let mut engine: Option<Box<dyn OcrEngine>> = None;
    let mut engine_failed = false;

    loop {
        let task = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if state.shutdown && state.queue.is_empty() {
                    return;
                }
                if let Some(until) = state.paused_until {
                    let now = Instant::now();
                    if now < until {
                        let (guard, _) = shared
                            .task_ready
                            .wait_timeout(state, until - now)
                            .unwrap();
                        state = guard;
                        continue;
                    }
                    state.paused_until = None;
                }
                if state.batch_remaining == 0 && !state.queue.is_empty() {
                    // Consult the controller between batches; sampling may
                    // block, so it runs outside the lock.
                    drop(state);
                    let plan = shared.controller.next_batch();
                    state = shared.state.lock().unwrap();
                    state.active_workers = plan.workers;
                    state.batch_remaining = shared.batch_pages;
                    if let Some(backoff) = plan.backoff {
                        state.paused_until = Some(Instant::now() + backoff);
                    }
                    shared.task_ready.notify_all();
                    continue;
                }
                if index >= state.active_workers {
                    state = shared.task_ready.wait(state).unwrap();
                    continue;
                }
                match state.queue.pop_front() {
                    Some(task) => {
                        shared.space_ready.notify_one();
                        if !state.groups.contains_key(&task.group) {
                            // Abandoned group; drop the task.
                            continue;
                        }
                        state.batch_remaining = state.batch_remaining.saturating_sub(1);
                        if let Some(entry) = state.groups.get_mut(&task.group) {
                            entry.state = GroupState::Dispatched;
                        }
                        break task;
                    }
                    None => {
                        state = shared.task_ready.wait(state).unwrap();
                    }
                }
            }
        };

        if engine.is_none() && !engine_failed {
            match shared.factory.create() {
                Ok(created) => {
                    engine = Some(created);
                    shared.state.lock().unwrap().stats.engine_inits += 1;
                }
                Err(e) => {
                    engine_failed = true;
                    record_init_failure(&shared, &e.to_string());
                }
            }
        }

        match engine.as_mut() {
            Some(engine) => {
                let started = Instant::now();
                let (text, failed) = match engine.recognize(&task.image, &shared.languages) {
                    Ok(lines) => (assemble_text(&lines), false),
                    Err(_) => (String::new(), true),
                };
                complete_task(
                    &shared,
                    &task.group,
                    task.page_index,
                    text,
                    failed,
                    started.elapsed(),
                );
            }
            None => {
                complete_task(
                    &shared,
                    &task.group,
                    task.page_index,
                    String::new(),
                    true,
                    Duration::ZERO,
                );
            }
        }
    }
}
