use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use crate::core::module::Module;
use crate::error::{SchedulerError, SchedulerResult};
use crate::scheduling::group::{Group, GroupMember};

struct LoopFlags {
    is_running: bool,
    should_stop: bool,
}

/// Shared driver state: the root group plus the loop mutex, condition
/// variable and flags. Modules reach it through their weak loop handle.
pub(crate) struct LoopCore {
    architecture: Arc<dyn Group>,
    flags: Mutex<LoopFlags>,
    cv: Condvar,
}

impl LoopCore {
    pub(crate) fn architecture(&self) -> &Arc<dyn Group> {
        &self.architecture
    }

    fn lock_flags(&self) -> MutexGuard<'_, LoopFlags> {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request_stop(&self) {
        let mut flags = self.lock_flags();
        if flags.is_running {
            flags.should_stop = true;
            drop(flags);
            // Workers parked in an open-ended wait_for_availability must
            // re-check the stop boundary now, not at the next natural
            // completion.
            self.architecture.notify_waiters();
        }
    }

    fn is_running(&self) -> bool {
        self.lock_flags().is_running
    }

    /// One worker. All workers race to recycle the iteration; the loop
    /// mutex arbitrates, and the double check under it keeps the recycle
    /// single-shot per boundary.
    fn worker(&self) {
        let root = &self.architecture;
        loop {
            if root.is_done() {
                let flags = self.lock_flags();
                if root.is_done() {
                    if flags.should_stop {
                        return;
                    }
                    if let Err(error) = root.start_next_iteration() {
                        log::debug!("iteration recycle raced: {error}");
                    }
                }
                drop(flags);
            }
            if !root.run_next(0.0) {
                root.wait_for_availability(0.0, 0.0);
            }
        }
    }
}

/// Drives a worker pool over a group tree (the *architecture*), executing
/// one iteration of the root group after another until stopped.
///
/// # Example
/// ```rust,ignore
/// let root = SequentialGroup::new(vec![sensor.into(), control.into()])?;
/// let scheduler_loop = Loop::new(root)?;
/// scheduler_loop.run(4)?; // blocks until a module calls stop()
/// ```
pub struct Loop {
    core: Arc<LoopCore>,
    groups: Vec<Arc<dyn Group>>,
    modules: Vec<Arc<Module>>,
}

impl Loop {
    /// Takes ownership of the architecture and installs the loop
    /// back-pointer on every descendant group and module, breadth-first.
    /// Fails with [`SchedulerError::AlreadyInLoop`] and rolls every install
    /// back if any descendant already belongs to another loop.
    pub fn new(architecture: Arc<dyn Group>) -> SchedulerResult<Self> {
        let core = Arc::new(LoopCore {
            architecture: Arc::clone(&architecture),
            flags: Mutex::new(LoopFlags {
                is_running: false,
                should_stop: false,
            }),
            cv: Condvar::new(),
        });

        let (groups, modules) = collect_tree(&architecture);
        let weak = Arc::downgrade(&core);
        let mut installed_groups = 0;
        let mut installed_modules = 0;
        let conflict = 'install: {
            for group in &groups {
                if !group.attachment().try_set_loop(&weak) {
                    break 'install true;
                }
                installed_groups += 1;
            }
            for module in &modules {
                if !module.attachment().try_set_loop(&weak) {
                    break 'install true;
                }
                installed_modules += 1;
            }
            false
        };
        if conflict {
            for group in &groups[..installed_groups] {
                group.attachment().clear_loop();
            }
            for module in &modules[..installed_modules] {
                module.attachment().clear_loop();
            }
            log::debug!("loop attachment rolled back: a member is already in another loop");
            return Err(SchedulerError::AlreadyInLoop);
        }

        Ok(Self {
            core,
            groups,
            modules,
        })
    }

    /// Runs the loop on `thread_count` workers, blocking until it stops.
    /// `0` uses the number of logical CPU cores. The calling thread is one
    /// of the workers, so a single-threaded loop spawns nothing.
    pub fn run(&self, thread_count: usize) -> SchedulerResult<()> {
        let thread_count = if thread_count == 0 {
            num_cpus::get().max(1)
        } else {
            thread_count
        };

        {
            let mut flags = self.core.lock_flags();
            if flags.is_running {
                return Err(SchedulerError::LoopAlreadyRunning);
            }
            flags.is_running = true;
            flags.should_stop = false;
        }
        log::debug!("loop starting with {thread_count} worker thread(s)");

        let mut handles = Vec::with_capacity(thread_count - 1);
        for _ in 1..thread_count {
            let core = Arc::clone(&self.core);
            handles.push(thread::spawn(move || core.worker()));
        }
        self.core.worker();
        for handle in handles {
            let _ = handle.join();
        }

        self.core.lock_flags().is_running = false;
        self.core.cv.notify_all();
        log::debug!("loop stopped");
        Ok(())
    }

    /// Requests a stop; takes effect at the next iteration boundary.
    pub fn stop(&self) {
        self.core.request_stop();
    }

    /// Requests a stop and blocks until the workers have exited. Must not
    /// be called from inside a module: the calling worker could never
    /// finish, which deadlocks the wait.
    pub fn stop_and_wait(&self) {
        self.core.request_stop();
        let flags = self.core.lock_flags();
        if flags.is_running {
            let _flags = self
                .core
                .cv
                .wait_while(flags, |flags| flags.is_running)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    /// The root group this loop drives.
    pub fn architecture(&self) -> &Arc<dyn Group> {
        &self.core.architecture
    }
}

impl Drop for Loop {
    fn drop(&mut self) {
        self.stop_and_wait();
        for group in &self.groups {
            group.attachment().clear_loop();
        }
        for module in &self.modules {
            module.attachment().clear_loop();
        }
    }
}

/// A cheap handle on the enclosing loop, obtainable from an attached module.
/// Lets module bodies request a stop without owning the [`Loop`].
pub struct LoopHandle {
    core: Arc<LoopCore>,
}

impl LoopHandle {
    pub(crate) fn new(core: Arc<LoopCore>) -> Self {
        Self { core }
    }

    /// Requests a stop; takes effect at the next iteration boundary.
    pub fn stop(&self) {
        self.core.request_stop();
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }
}

/// Breadth-first walk of the architecture, deduplicating shared members by
/// pointer identity.
fn collect_tree(architecture: &Arc<dyn Group>) -> (Vec<Arc<dyn Group>>, Vec<Arc<Module>>) {
    let mut groups: Vec<Arc<dyn Group>> = vec![Arc::clone(architecture)];
    let mut modules: Vec<Arc<Module>> = Vec::new();
    let mut next = 0;
    while next < groups.len() {
        let group = Arc::clone(&groups[next]);
        next += 1;
        for member in group.members() {
            match member {
                GroupMember::Group(subgroup) => {
                    let seen = groups.iter().any(|known| {
                        Arc::as_ptr(known) as *const () == Arc::as_ptr(subgroup) as *const ()
                    });
                    if !seen {
                        groups.push(Arc::clone(subgroup));
                    }
                }
                GroupMember::Module(module) => {
                    let seen = modules
                        .iter()
                        .any(|known| Arc::ptr_eq(known, module));
                    if !seen {
                        modules.push(Arc::clone(module));
                    }
                }
            }
        }
    }
    (groups, modules)
}
