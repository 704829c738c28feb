use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;
use tether::TetherError;
use tether::config::ExecutorConfig;
use tether::core::executor::{Executor, ThreadPool, Work};

fn pool() -> ThreadPool {
    ThreadPool::new(&ExecutorConfig {
        max_threads: 8,
        thread_name: "tether-test".into(),
        keep_alive: Duration::from_secs(1),
    })
    .unwrap()
}

/// A flag a test thread can block on until another thread raises it.
#[derive(Default)]
struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    fn open(&self) {
        *self.open.lock() = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cond.wait(&mut open);
        }
    }
}

#[test]
fn test_posted_work_runs_and_finishes() {
    let pool = pool();
    let (tx, rx) = mpsc::channel();
    let handle = pool
        .post(Work::new("send", move || tx.send(42).unwrap()))
        .unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 42);
    assert!(handle.join_timeout(Duration::from_secs(2)));
    assert!(handle.is_finished());
    assert_eq!(handle.name(), "send");
}

#[test]
fn test_work_reports_its_thread() {
    let pool = pool();
    let (tx, rx) = mpsc::channel();
    let handle = pool
        .post(Work::new("thread", move || {
            tx.send(std::thread::current().id()).unwrap()
        }))
        .unwrap();
    let ran_on = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(handle.join_timeout(Duration::from_secs(2)));
    assert_eq!(handle.thread_id(), Some(ran_on));
    assert!(!handle.is_current_thread());
}

#[test]
fn test_cancel_invokes_stop_hook_and_joins() {
    let pool = pool();
    let gate = Arc::new(Gate::default());
    let started = Arc::new(Gate::default());
    let stopped = Arc::new(AtomicBool::new(false));

    let run_gate = gate.clone();
    let run_started = started.clone();
    let stop_gate = gate.clone();
    let stop_flag = stopped.clone();
    let handle = pool
        .post(
            Work::new("loop", move || {
                run_started.open();
                run_gate.wait();
            })
            .with_stop(move || {
                stop_flag.store(true, Ordering::SeqCst);
                stop_gate.open();
            }),
        )
        .unwrap();

    started.wait();
    handle.cancel();
    assert!(stopped.load(Ordering::SeqCst));
    assert!(handle.is_cancelled());
    assert!(handle.is_finished());
}

#[test]
fn test_join_timeout_expires_for_running_work() {
    let pool = pool();
    let gate = Arc::new(Gate::default());
    let run_gate = gate.clone();
    let handle = pool
        .post(Work::new("blocked", move || run_gate.wait()))
        .unwrap();
    assert!(!handle.join_timeout(Duration::from_millis(50)));
    gate.open();
    assert!(handle.join_timeout(Duration::from_secs(2)));
}

#[test]
fn test_cancel_from_own_thread_does_not_deadlock() {
    let pool = pool();
    let (handle_tx, handle_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();
    let handle = pool
        .post(Work::new("self-cancel", move || {
            let me: tether::core::executor::WorkHandle = handle_rx.recv().unwrap();
            me.cancel();
            done_tx.send(()).unwrap();
        }))
        .unwrap();
    handle_tx.send(handle.clone()).unwrap();
    done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(handle.join_timeout(Duration::from_secs(2)));
}

#[test]
fn test_many_work_items_all_run() {
    let pool = pool();
    let counter = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..32)
        .map(|i| {
            let counter = counter.clone();
            pool.post(Work::new(format!("count-{i}"), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap()
        })
        .collect();
    for handle in &handles {
        assert!(handle.join_timeout(Duration::from_secs(5)));
    }
    assert_eq!(counter.load(Ordering::SeqCst), 32);
}

#[test]
fn test_post_after_shutdown_fails() {
    let pool = pool();
    pool.shutdown();
    assert!(pool.is_shutdown());
    let err = pool.post(Work::new("late", || {})).unwrap_err();
    assert!(matches!(err, TetherError::Executor(_)));
}
