//! Scheduler scenario tests
//!
//! End-to-end behavior of the task manager with real pools: status
//! transitions, progress aggregation, pool caps and blocking cancellation.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::jobs::{
    FnTask, JobFilter, JobType, PoolConfig, PoolKind, TaskError, TaskManager, TaskManagerStatus,
};
use crate::core::ObjectId;

const WAIT_LIMIT: Duration = Duration::from_secs(5);

fn manager(general: usize, constrained: usize) -> TaskManager {
    TaskManager::new(
        PoolConfig::default()
            .with_general_workers(general)
            .with_constrained_workers(constrained),
    )
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let polled = tokio::time::timeout(WAIT_LIMIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

/// Job that reports `progress` and then holds its worker until cancelled
fn held(job_type: JobType, progress: u8) -> FnTask {
    FnTask::new(job_type, move |ctx| async move {
        ctx.set_progress(progress);
        ctx.cancelled().await;
        Err(TaskError::Cancelled)
    })
}

#[derive(Default)]
struct Concurrency {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Concurrency {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

fn tracked(job_type: JobType, concurrency: &Arc<Concurrency>, work: Duration) -> FnTask {
    let concurrency = Arc::clone(concurrency);
    FnTask::new(job_type, move |ctx| async move {
        concurrency.enter();
        tokio::select! {
            _ = tokio::time::sleep(work) => {}
            _ = ctx.cancelled() => {}
        }
        concurrency.exit();
        Ok(())
    })
}

// =============================================================================
// Queries
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_owner_without_jobs_is_idle() {
    let tm = manager(2, 2);
    for id in 0..10 {
        let owner = ObjectId::bin_clip(id);
        assert_eq!(tm.job_status(owner), TaskManagerStatus::NoJob);
        assert_eq!(tm.job_progress(owner), 100);
        assert!(!tm.has_pending_job(owner, JobFilter::Any));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pending_until_completion() {
    let tm = manager(2, 2);
    let owner = ObjectId::bin_clip(1);
    let release = Arc::new(tokio::sync::Notify::new());

    let task = {
        let release = Arc::clone(&release);
        FnTask::new(JobType::Analysis, move |_| async move {
            release.notified().await;
            Ok(())
        })
    };
    tm.start_task(owner, task);

    assert!(tm.has_pending_job(owner, JobFilter::Any));
    assert!(tm.has_pending_job(owner, JobType::Analysis));
    assert!(!tm.has_pending_job(owner, JobType::Proxy));

    release.notify_one();
    wait_until("job completion", || !tm.has_pending_job(owner, JobFilter::Any)).await;
    assert_eq!(tm.job_status(owner), TaskManagerStatus::NoJob);
    assert_eq!(tm.job_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_running_job_outweighs_queued_ones() {
    let tm = manager(1, 1);
    let owner = ObjectId::bin_clip(2);

    tm.start_task(owner, held(JobType::Generic, 0));
    tm.start_task(owner, held(JobType::Generic, 0));
    tm.start_task(owner, held(JobType::Generic, 0));

    wait_until("first job to start", || {
        tm.jobs_for(owner).iter().any(|h| h.is_running())
    })
    .await;
    assert_eq!(tm.job_status(owner), TaskManagerStatus::Running);
    assert_eq!(tm.jobs_for(owner).iter().filter(|h| h.is_running()).count(), 1);

    tm.discard_jobs(owner, JobFilter::Any).await;
    assert_eq!(tm.job_status(owner), TaskManagerStatus::NoJob);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_progress_is_truncated_mean() {
    let tm = manager(2, 2);
    let owner = ObjectId::bin_clip(3);

    tm.start_task(owner, held(JobType::Analysis, 40));
    tm.start_task(owner, held(JobType::Analysis, 61));

    wait_until("both jobs to report progress", || {
        let jobs = tm.jobs_for(owner);
        jobs.len() == 2 && jobs.iter().all(|h| h.progress() > 0)
    })
    .await;
    assert_eq!(tm.job_progress(owner), 50);

    tm.discard_jobs(owner, JobFilter::Any).await;
    assert_eq!(tm.job_progress(owner), 100);
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_discard_waits_for_jobs_to_stop() {
    let tm = manager(2, 2);
    let owner = ObjectId::bin_clip(4);
    let stopped = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let stopped = Arc::clone(&stopped);
        tm.start_task(
            owner,
            FnTask::new(JobType::Generic, move |ctx| async move {
                while !ctx.is_cancelled() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                // Simulated cleanup after the stop request
                tokio::time::sleep(Duration::from_millis(30)).await;
                stopped.fetch_add(1, Ordering::SeqCst);
                Err(TaskError::Cancelled)
            }),
        );
    }
    wait_until("jobs to start", || {
        tm.jobs_for(owner).iter().filter(|h| h.is_running()).count() == 2
    })
    .await;
    let handles = tm.jobs_for(owner);

    tm.discard_jobs(owner, JobFilter::Any).await;

    assert_eq!(stopped.load(Ordering::SeqCst), 2);
    assert!(!tm.has_pending_job(owner, JobFilter::Any));
    assert!(handles.iter().all(|h| h.is_finished()));
    assert_eq!(handles.iter().filter(|h| h.is_running()).count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_discarded_handles_no_longer_report_running() {
    let tm = manager(2, 2);
    let owner = ObjectId::bin_clip(12);

    tm.start_task(owner, held(JobType::Generic, 30));
    wait_until("job to start", || tm.job_status(owner) == TaskManagerStatus::Running).await;
    let handles = tm.jobs_for(owner);
    assert!(handles[0].is_running());

    tm.discard_jobs(owner, JobFilter::Any).await;

    assert!(handles[0].is_finished());
    assert!(!handles[0].is_running());
    assert_eq!(tm.job_status(owner), TaskManagerStatus::NoJob);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_discard_filters_by_type() {
    let tm = manager(2, 2);
    let owner = ObjectId::bin_clip(5);

    tm.start_task(owner, held(JobType::Proxy, 0));
    tm.start_task(owner, held(JobType::Analysis, 0));

    tm.discard_jobs(owner, JobType::Proxy).await;
    assert!(!tm.has_pending_job(owner, JobType::Proxy));
    assert!(tm.has_pending_job(owner, JobType::Analysis));

    tm.discard_jobs(owner, JobFilter::Any).await;
    assert!(!tm.has_pending_job(owner, JobFilter::Any));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_discard_withdraws_queued_job_without_running_it() {
    let tm = manager(1, 1);
    let busy = ObjectId::bin_clip(6);
    let owner = ObjectId::bin_clip(7);
    let ran = Arc::new(AtomicBool::new(false));

    tm.start_task(busy, held(JobType::Proxy, 0));
    wait_until("blocker to start", || tm.job_status(busy) == TaskManagerStatus::Running).await;

    {
        let ran = Arc::clone(&ran);
        tm.start_task(
            owner,
            FnTask::new(JobType::Proxy, move |_| async move {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            }),
        );
    }
    assert_eq!(tm.job_status(owner), TaskManagerStatus::Pending);

    tokio::time::timeout(WAIT_LIMIT, tm.discard_jobs(owner, JobFilter::Any))
        .await
        .expect("queued job must not wait for a worker slot");
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(tm.job_status(busy), TaskManagerStatus::Running);

    tm.cancel_all_jobs().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_job_can_discard_its_own_owner() {
    let tm = manager(1, 1);
    let owner = ObjectId::bin_clip(8);
    let sibling_ran = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let sibling_queued = Arc::new(tokio::sync::Notify::new());

    {
        let tm_inner = tm.clone();
        let finished = Arc::clone(&finished);
        let sibling_queued = Arc::clone(&sibling_queued);
        tm.start_task(
            owner,
            FnTask::new(JobType::Generic, move |ctx| async move {
                sibling_queued.notified().await;
                tm_inner.discard_jobs(ctx.owner(), JobFilter::Any).await;
                finished.store(true, Ordering::SeqCst);
                ctx.check_cancelled()
            }),
        );
    }
    {
        let sibling_ran = Arc::clone(&sibling_ran);
        tm.start_task(
            owner,
            FnTask::new(JobType::Generic, move |_| async move {
                sibling_ran.store(true, Ordering::SeqCst);
                Ok(())
            }),
        );
    }

    sibling_queued.notify_one();

    wait_until("self-discarding job to finish", || tm.job_count() == 0).await;
    assert!(finished.load(Ordering::SeqCst));
    assert!(!sibling_ran.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_all_jobs_across_owners() {
    let tm = manager(2, 2);
    let mut rx = tm.subscribe_job_count();

    for id in 0..3 {
        tm.start_task(ObjectId::bin_clip(id), held(JobType::Generic, 10));
        tm.start_task(ObjectId::bin_clip(id), held(JobType::Transcode, 10));
    }
    assert_eq!(tm.job_count(), 6);
    assert_eq!(rx.borrow_and_update().outstanding, 6);

    tm.cancel_all_jobs().await;
    assert_eq!(tm.job_count(), 0);
    assert!(rx.has_changed().unwrap());
    assert_eq!(rx.borrow_and_update().outstanding, 0);
}

// =============================================================================
// Failure Handling
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_and_panicking_jobs_still_leave_registry() {
    let tm = manager(2, 2);
    let owner = ObjectId::bin_clip(9);

    tm.start_task(
        owner,
        FnTask::new(JobType::Analysis, |_| async {
            Err(TaskError::Failed("decoder error".to_string()))
        }),
    );
    tm.start_task(owner, FnTask::new(JobType::Analysis, |_| async { panic!("analysis bug") }));

    wait_until("failed jobs to complete", || tm.job_count() == 0).await;
    assert_eq!(tm.job_status(owner), TaskManagerStatus::NoJob);

    // Workers survive and keep serving
    tm.start_task(owner, FnTask::new(JobType::Analysis, |_| async { Ok(()) }));
    wait_until("follow-up job", || tm.job_count() == 0).await;
}

// =============================================================================
// Pool Caps
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_constrained_pool_caps_concurrency() {
    let tm = TaskManager::with_defaults();
    assert_eq!(tm.pool(PoolKind::Constrained).num_workers(), 2);

    let owners: Vec<ObjectId> = (0..5).map(ObjectId::bin_clip).collect();
    for owner in &owners {
        tm.start_task(*owner, held(JobType::Proxy, 0));
    }

    wait_until("constrained pool to fill", || {
        tm.pool(PoolKind::Constrained).running_count() == 2
    })
    .await;
    // Give any overcommitted worker a chance to show up
    tokio::time::sleep(Duration::from_millis(50)).await;

    let running = owners
        .iter()
        .filter(|o| tm.job_status(**o) == TaskManagerStatus::Running)
        .count();
    let pending = owners
        .iter()
        .filter(|o| tm.job_status(**o) == TaskManagerStatus::Pending)
        .count();
    assert_eq!(running, 2);
    assert_eq!(pending, 3);

    tm.cancel_all_jobs().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_constrained_peak_never_exceeds_two() {
    let tm = TaskManager::with_defaults();
    let concurrency = Arc::new(Concurrency::default());

    for id in 0..5 {
        tm.start_task(
            ObjectId::bin_clip(id),
            tracked(JobType::Transcode, &concurrency, Duration::from_millis(40)),
        );
    }

    wait_until("all transcodes", || tm.job_count() == 0).await;
    assert_eq!(concurrency.peak(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_general_pool_of_three_runs_three_of_six() {
    let tm = manager(3, 2);
    let owner = ObjectId::bin_clip(10);

    for _ in 0..6 {
        tm.start_task(owner, held(JobType::Generic, 0));
    }
    wait_until("general pool to fill", || tm.pool(PoolKind::General).running_count() == 3).await;

    for _ in 0..5 {
        let jobs = tm.jobs_for(owner);
        let running = jobs.iter().filter(|h| h.is_running()).count();
        assert_eq!(running, 3);
        assert_eq!(jobs.len() - running, 3);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    tm.discard_jobs(owner, JobFilter::Any).await;
    assert_eq!(tm.job_count(), 0);
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_proxy_lifecycle_with_count_notification() {
    let tm = manager(2, 1);
    let blocker_owner = ObjectId::bin_clip(100);
    let owner = ObjectId::bin_clip(101);
    let mut rx = tm.subscribe_job_count();

    assert_eq!(tm.job_status(owner), TaskManagerStatus::NoJob);

    // Occupy the single constrained worker so the proxy job has to queue
    let unblock = Arc::new(tokio::sync::Notify::new());
    {
        let unblock = Arc::clone(&unblock);
        tm.start_task(
            blocker_owner,
            FnTask::new(JobType::Transcode, move |_| async move {
                unblock.notified().await;
                Ok(())
            }),
        );
    }
    wait_until("blocker to run", || {
        tm.job_status(blocker_owner) == TaskManagerStatus::Running
    })
    .await;

    tm.start_task(owner, held(JobType::Proxy, 0));
    assert_eq!(tm.job_status(owner), TaskManagerStatus::Pending);
    assert_eq!(rx.borrow_and_update().outstanding, 2);

    unblock.notify_one();
    wait_until("proxy job to run", || tm.job_status(owner) == TaskManagerStatus::Running).await;
    assert_eq!(rx.borrow_and_update().outstanding, 1);

    tm.discard_jobs(owner, JobType::Proxy).await;
    assert_eq!(tm.job_status(owner), TaskManagerStatus::NoJob);
    assert!(rx.has_changed().unwrap());
    let count = *rx.borrow_and_update();
    assert_eq!(count.outstanding, 0);
    assert_eq!(count.outstanding, tm.job_count());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dropping_manager_cancels_outstanding_jobs() {
    let tm = manager(1, 1);
    let owner = ObjectId::bin_clip(11);

    tm.start_task(owner, held(JobType::Generic, 0));
    wait_until("job to run", || tm.job_status(owner) == TaskManagerStatus::Running).await;
    let handle = tm.jobs_for(owner).remove(0);

    drop(tm);
    assert!(handle.is_cancelled());
    tokio::time::timeout(WAIT_LIMIT, handle.wait_finished())
        .await
        .expect("cancelled job should finish after the manager is gone");
}
