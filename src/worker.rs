use crate::markup::Markup;
use crate::{minify, optimize, Config, PowerLevel, RenderError, RunMode};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

/// Settings the transforms read; copied into every worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformSettings {
    pub power_level: PowerLevel,
    pub run_mode: RunMode,
}

impl From<&Config> for TransformSettings {
    fn from(config: &Config) -> Self {
        Self {
            power_level: config.power_level,
            run_mode: config.run_mode,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformOperation {
    Compress,
    Optimize { full_optimize: bool },
}

#[derive(Debug, Clone)]
pub struct TransformTask {
    pub operation: TransformOperation,
    pub markup: Markup,
}

impl TransformTask {
    pub fn run(self, settings: &TransformSettings) -> Result<String, RenderError> {
        match self.operation {
            TransformOperation::Compress => minify::compress(self.markup, settings),
            TransformOperation::Optimize { full_optimize } => {
                optimize::optimize(self.markup, full_optimize, settings)
            }
        }
    }
}

struct Job {
    task: TransformTask,
    reply: oneshot::Sender<Result<String, RenderError>>,
}

struct TransformWorker {
    id: usize,
    settings: TransformSettings,
    is_running: Arc<AtomicBool>,
    processed_count: Arc<AtomicUsize>,
    error_count: Arc<AtomicUsize>,
}

impl TransformWorker {
    fn new(id: usize, settings: TransformSettings) -> Self {
        Self {
            id,
            settings,
            is_running: Arc::new(AtomicBool::new(false)),
            processed_count: Arc::new(AtomicUsize::new(0)),
            error_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn run_with_shared_receiver(&self, jobs: Arc<Mutex<mpsc::Receiver<Job>>>) {
        debug!("Starting transform worker {}", self.id);
        self.is_running.store(true, Ordering::Relaxed);

        loop {
            let job = {
                let mut receiver = jobs.blocking_lock();
                receiver.blocking_recv()
            };
            let Some(job) = job else { break };

            let operation = job.task.operation;
            let result = job.task.run(&self.settings);
            match &result {
                Ok(_) => {
                    self.processed_count.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.error_count.fetch_add(1, Ordering::Relaxed);
                    warn!("Worker {} failed {:?}: {}", self.id, operation, e);
                }
            }

            if job.reply.send(result).is_err() {
                debug!("Worker {}: submitter went away before the result was ready", self.id);
            }
        }

        self.is_running.store(false, Ordering::Relaxed);
        debug!("Transform worker {} stopped", self.id);
    }

    fn get_stats(&self) -> WorkerStats {
        WorkerStats {
            id: self.id,
            is_running: self.is_running.load(Ordering::Relaxed),
            processed_count: self.processed_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }
}

impl Clone for TransformWorker {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            settings: self.settings,
            is_running: self.is_running.clone(),
            processed_count: self.processed_count.clone(),
            error_count: self.error_count.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub id: usize,
    pub is_running: bool,
    pub processed_count: usize,
    pub error_count: usize,
}

/// Fixed pool of OS threads running markup transforms off the async runtime
pub struct TransformPool {
    workers: Vec<TransformWorker>,
    job_sender: std::sync::Mutex<Option<mpsc::Sender<Job>>>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl TransformPool {
    pub fn new(worker_count: usize, settings: TransformSettings) -> Result<Self, RenderError> {
        let worker_count = worker_count.max(1);
        let (job_sender, job_receiver) = mpsc::channel(1000);
        let shared_receiver = Arc::new(Mutex::new(job_receiver));

        let workers: Vec<TransformWorker> = (0..worker_count)
            .map(|id| TransformWorker::new(id, settings))
            .collect();

        let mut handles = Vec::with_capacity(worker_count);
        for worker in &workers {
            let worker_clone = worker.clone();
            let rx = shared_receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("transform-{}", worker.id))
                .spawn(move || worker_clone.run_with_shared_receiver(rx))?;
            handles.push(handle);
        }

        info!("Transform pool started with {} workers", worker_count);

        Ok(Self {
            workers,
            job_sender: std::sync::Mutex::new(Some(job_sender)),
            handles: std::sync::Mutex::new(handles),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, RenderError> {
        Self::new(config.max_workers, TransformSettings::from(config))
    }

    fn sender(&self) -> Result<mpsc::Sender<Job>, RenderError> {
        self.job_sender
            .lock()
            .map_err(|_| RenderError::WorkerPoolClosed)?
            .clone()
            .ok_or(RenderError::WorkerPoolClosed)
    }

    pub async fn submit(&self, task: TransformTask) -> Result<String, RenderError> {
        let (reply, result) = oneshot::channel();
        self.sender()?
            .send(Job { task, reply })
            .await
            .map_err(|_| RenderError::WorkerPoolClosed)?;
        result.await.map_err(|_| RenderError::WorkerPoolClosed)?
    }

    pub async fn compress(&self, markup: impl Into<Markup>) -> Result<String, RenderError> {
        self.submit(TransformTask {
            operation: TransformOperation::Compress,
            markup: markup.into(),
        })
        .await
    }

    pub async fn optimize(
        &self,
        markup: impl Into<Markup>,
        full_optimize: bool,
    ) -> Result<String, RenderError> {
        self.submit(TransformTask {
            operation: TransformOperation::Optimize { full_optimize },
            markup: markup.into(),
        })
        .await
    }

    pub fn get_worker_stats(&self) -> Vec<WorkerStats> {
        self.workers.iter().map(|w| w.get_stats()).collect()
    }

    pub fn total_processed(&self) -> usize {
        self.workers.iter().map(|w| w.get_stats().processed_count).sum()
    }

    pub fn total_errors(&self) -> usize {
        self.workers.iter().map(|w| w.get_stats().error_count).sum()
    }

    /// Close the queue and join the worker threads once in-flight jobs finish.
    pub fn shutdown(&self) {
        if let Ok(mut sender) = self.job_sender.lock() {
            sender.take();
        }
        let handles = match self.handles.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(_) => return,
        };
        for handle in handles {
            if handle.join().is_err() {
                warn!("Transform worker panicked during shutdown");
            }
        }
        info!("Transform pool stopped");
    }
}

impl Drop for TransformPool {
    fn drop(&mut self) {
        if let Ok(mut sender) = self.job_sender.lock() {
            sender.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> TransformSettings {
        TransformSettings {
            power_level: PowerLevel::Two,
            run_mode: RunMode::Production,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_runs_both_operations() {
        let pool = TransformPool::new(2, settings()).unwrap();

        let compressed = pool.compress("<div>  <p> a </p> </div>").await.unwrap();
        assert_eq!(compressed, "<div><p>a</p></div>");

        let optimized = pool
            .optimize("<p>x</p><script>track()</script>", false)
            .await
            .unwrap();
        assert_eq!(optimized, "<p>x</p>");

        assert_eq!(pool.total_processed(), 2);
        assert_eq!(pool.total_errors(), 0);
        pool.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_errors_are_returned_to_the_submitter() {
        let pool = TransformPool::new(1, settings()).unwrap();
        let result = pool
            .submit(TransformTask {
                operation: TransformOperation::Compress,
                markup: Markup::Compressed(vec![0, 1, 2]),
            })
            .await;

        assert!(matches!(result, Err(RenderError::Compression(_))));
        assert_eq!(pool.total_errors(), 1);
        pool.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_submissions() {
        let pool = Arc::new(TransformPool::new(3, settings()).unwrap());
        let mut tasks = Vec::new();
        for i in 0..20 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                pool.compress(format!("<p>  item {i}  </p>")).await
            }));
        }

        for (i, task) in tasks.into_iter().enumerate() {
            assert_eq!(task.await.unwrap().unwrap(), format!("<p>item {i}</p>"));
        }
        assert_eq!(pool.get_worker_stats().len(), 3);
        pool.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_submit_after_shutdown_fails() {
        let pool = TransformPool::new(1, settings()).unwrap();
        pool.shutdown();
        assert!(matches!(
            pool.compress("<p>x</p>").await,
            Err(RenderError::WorkerPoolClosed)
        ));
    }
}
