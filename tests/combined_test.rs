// Mixed architectures: budget-steered dispatch, cooperative idling, stop
// semantics, and a deeply nested tree under a full worker pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use loopsched::{
    BiasedEmaPredictor, CanRunPolicy, Group, Loop, LoopHandle, Module, ModuleBody,
    ParallelGroup, ParallelMember, SequentialGroup,
};

struct Counting {
    runs: Arc<AtomicUsize>,
}

impl ModuleBody for Counting {
    fn on_run(&self) {
        self.runs.fetch_add(1, Ordering::SeqCst);
    }
}

fn counting_module(runs: &Arc<AtomicUsize>) -> Arc<Module> {
    Arc::new(Module::new(
        CanRunPolicy::Exclusive,
        Counting {
            runs: Arc::clone(runs),
        },
    ))
}

fn preset_module(runs: &Arc<AtomicUsize>, higher: f64, lower: f64) -> Arc<Module> {
    Arc::new(Module::with_predictors(
        CanRunPolicy::Exclusive,
        Counting {
            runs: Arc::clone(runs),
        },
        Box::new(BiasedEmaPredictor::higher_band(higher)),
        Box::new(BiasedEmaPredictor::lower_band(lower)),
    ))
}

/// A fast and a slow module share a parallel tail of a sequential pipeline;
/// a 5 ms budget admits only the fast one.
#[test]
fn budget_steers_dispatch_through_the_tree() {
    let front_runs = Arc::new(AtomicUsize::new(0));
    let fast_runs = Arc::new(AtomicUsize::new(0));
    let slow_runs = Arc::new(AtomicUsize::new(0));

    let tail = ParallelGroup::new(vec![
        ParallelMember::new(preset_module(&slow_runs, 0.050, 0.040)),
        ParallelMember::new(preset_module(&fast_runs, 0.001, 0.001)),
    ])
    .unwrap();
    let root = SequentialGroup::new(vec![
        counting_module(&front_runs).into(),
        tail.into(),
    ])
    .unwrap();

    assert!(root.run_next(0.005));
    assert_eq!(front_runs.load(Ordering::SeqCst), 1);

    assert!(root.run_next(0.005));
    assert_eq!(fast_runs.load(Ordering::SeqCst), 1);
    assert_eq!(slow_runs.load(Ordering::SeqCst), 0);

    // Only the slow module is left, and it exceeds the budget.
    assert!(!root.run_next(0.005));
    assert!(!root.is_done());

    // Lifting the budget lets the iteration finish.
    assert!(root.run_next(0.0));
    assert_eq!(slow_runs.load(Ordering::SeqCst), 1);
    assert!(root.is_done());
}

struct IdlerInner {
    module: Mutex<Weak<Module>>,
    iterations: AtomicUsize,
    limit: usize,
    idle_secs: f64,
    handle: Mutex<Option<LoopHandle>>,
}

struct Idler(Arc<IdlerInner>);

impl ModuleBody for Idler {
    fn on_run(&self) {
        let inner = &self.0;
        let iterations = inner.iterations.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(module) = inner.module.lock().unwrap().upgrade() {
            // The thread keeps dispatching other modules while this module
            // conceptually blocks.
            module.idle(inner.idle_secs).unwrap();
        }
        if iterations >= inner.limit {
            if let Some(handle) = inner.handle.lock().unwrap().as_ref() {
                handle.stop();
            }
        }
    }
}

/// With a single worker thread, an idling module must not stall the loop:
/// the worker it yields keeps running the sibling's re-run shares.
#[test]
fn idle_lends_the_thread_to_other_modules() {
    const ITERATIONS: usize = 3;
    const IDLE_SECS: f64 = 0.030;

    let inner = Arc::new(IdlerInner {
        module: Mutex::new(Weak::new()),
        iterations: AtomicUsize::new(0),
        limit: ITERATIONS,
        idle_secs: IDLE_SECS,
        handle: Mutex::new(None),
    });
    let idler = Arc::new(Module::new(CanRunPolicy::Exclusive, Idler(Arc::clone(&inner))));
    *inner.module.lock().unwrap() = Arc::downgrade(&idler);

    let worker_runs = Arc::new(AtomicUsize::new(0));
    // Re-run shares cycle on the secondary queue, so two of them keep the
    // worker continuously dispatchable for the rest of the iteration.
    let root = ParallelGroup::new(vec![
        ParallelMember::new(idler.clone()),
        ParallelMember::with_shares(counting_module(&worker_runs), 2),
    ])
    .unwrap();
    let scheduler_loop = Loop::new(root).unwrap();
    *inner.handle.lock().unwrap() = idler.loop_handle();

    let start = Instant::now();
    scheduler_loop.run(1).unwrap();
    let elapsed = start.elapsed();

    assert_eq!(inner.iterations.load(Ordering::SeqCst), ITERATIONS);
    // Each iteration spent ~30 ms idling on the only thread.
    assert!(elapsed >= Duration::from_secs_f64(ITERATIONS as f64 * IDLE_SECS * 0.9));
    // The worker made progress far beyond its one mandatory run per
    // iteration: the idler's thread kept dispatching it.
    let worker_runs = worker_runs.load(Ordering::SeqCst);
    assert!(
        worker_runs > ITERATIONS * 10,
        "worker only ran {worker_runs} times while the idler was parked"
    );
}

/// A background idling token keeps dispatching the tree from its own
/// thread until stopped, and stopping freezes all activity.
#[test]
fn background_idling_dispatches_the_tree_until_stopped() {
    let runs = Arc::new(AtomicUsize::new(0));
    let worker = counting_module(&runs);
    let root =
        ParallelGroup::new(vec![ParallelMember::with_shares(worker.clone(), 2)]).unwrap();
    let scheduler_loop = Loop::new(root).unwrap();

    let mut token = worker.start_idling(0.005, 0.0).unwrap();
    // A second call while the first token is live yields an inert token.
    let mut inert = worker.start_idling(0.005, 0.0).unwrap();
    inert.stop();

    while runs.load(Ordering::SeqCst) < 3 {
        thread::sleep(Duration::from_millis(1));
    }
    token.stop();
    let frozen = runs.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(10));
    assert_eq!(runs.load(Ordering::SeqCst), frozen);

    drop(scheduler_loop);
}

struct Napper;

impl ModuleBody for Napper {
    fn on_run(&self) {
        thread::sleep(Duration::from_millis(2));
    }
}

/// `stop()` followed by `stop_and_wait()` behaves like `stop_and_wait()`
/// alone, and both leave the loop restartable.
#[test]
fn stop_then_stop_and_wait_matches_stop_and_wait_alone() {
    let module = Arc::new(Module::new(CanRunPolicy::Exclusive, Napper));
    let root = SequentialGroup::new(vec![module.into()]).unwrap();
    let scheduler_loop = Arc::new(Loop::new(root).unwrap());

    for use_plain_stop_first in [true, false] {
        let runner = Arc::clone(&scheduler_loop);
        let handle = thread::spawn(move || runner.run(2));
        while !scheduler_loop.is_running() {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(10));

        if use_plain_stop_first {
            scheduler_loop.stop();
        }
        scheduler_loop.stop_and_wait();
        assert!(!scheduler_loop.is_running());
        handle.join().unwrap().unwrap();
    }
}

struct NestedStopper {
    runs: Arc<AtomicUsize>,
    limit: usize,
    handle: Arc<Mutex<Option<LoopHandle>>>,
}

impl ModuleBody for NestedStopper {
    fn on_run(&self) {
        let runs = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        if runs >= self.limit {
            if let Some(handle) = self.handle.lock().unwrap().as_ref() {
                handle.stop();
            }
        }
    }
}

/// A three-level tree under four workers: the sequential pipeline inside
/// the parallel stage keeps its internal order, mandatory members run once
/// per iteration, and the share-holder at least once.
#[test]
fn nested_tree_keeps_its_counts_under_a_full_pool() {
    const ITERATIONS: usize = 20;

    let free_runs = Arc::new(AtomicUsize::new(0));
    let staged_a = Arc::new(AtomicUsize::new(0));
    let staged_b = Arc::new(AtomicUsize::new(0));
    let share_runs = Arc::new(AtomicUsize::new(0));
    let stopper_runs = Arc::new(AtomicUsize::new(0));
    let handle = Arc::new(Mutex::new(None));

    let pipeline = SequentialGroup::new(vec![
        counting_module(&staged_a).into(),
        counting_module(&staged_b).into(),
    ])
    .unwrap();
    let stage = ParallelGroup::new(vec![
        ParallelMember::new(counting_module(&free_runs)),
        ParallelMember::new(pipeline),
        ParallelMember::with_shares(counting_module(&share_runs), 2),
    ])
    .unwrap();
    let stopper = Arc::new(Module::new(
        CanRunPolicy::Exclusive,
        NestedStopper {
            runs: Arc::clone(&stopper_runs),
            limit: ITERATIONS,
            handle: Arc::clone(&handle),
        },
    ));
    let root = SequentialGroup::new(vec![stage.into(), stopper.clone().into()]).unwrap();
    let scheduler_loop = Loop::new(root).unwrap();
    *handle.lock().unwrap() = stopper.loop_handle();

    scheduler_loop.run(4).unwrap();

    assert_eq!(stopper_runs.load(Ordering::SeqCst), ITERATIONS);
    assert_eq!(free_runs.load(Ordering::SeqCst), ITERATIONS);
    assert_eq!(staged_a.load(Ordering::SeqCst), ITERATIONS);
    assert_eq!(staged_b.load(Ordering::SeqCst), ITERATIONS);
    assert!(share_runs.load(Ordering::SeqCst) >= ITERATIONS);
}
