use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::trace;

use crate::runtime::machine::System;
use crate::runtime::thread::ThreadShared;

/// Operating states of a thread. `None` and the two terminal states frame
/// the lifecycle; `Active`, `Idle` and `Exclusive` drive the safe-point
/// protocol.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RunState {
    None,
    Active,
    Idle,
    Zombie,
    Exclusive,
    Exit,
}

pub(crate) struct ThreadEntry {
    pub shared: Arc<ThreadShared>,
    pub state: RunState,
    pub next: Option<usize>,
    pub child: Option<usize>,
}

pub(crate) struct CoordState {
    /// Threads in Active or Exclusive.
    pub active: u32,
    /// Threads not yet terminal.
    pub live: u32,
    /// The thread holding exclusive mode, if any.
    pub exclusive: Option<usize>,
    pub entries: Vec<ThreadEntry>,
    pub root: Option<usize>,
}

/// The state lock. Every transition, counter update and exclusive-mode
/// decision serializes through `state`; waiting happens on `cond`.
pub(crate) struct Coordinator {
    pub(crate) state: Mutex<CoordState>,
    cond: Condvar,
}

impl Coordinator {
    pub fn new() -> Coordinator {
        Coordinator {
            state: Mutex::new(CoordState {
                active: 0,
                live: 0,
                exclusive: None,
                entries: Vec::new(),
                root: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Creates and links a new thread into the registry: parentless threads
    /// chain off the root's `next`, children off the parent's `child`.
    pub fn register_shared(
        &self,
        m: &crate::runtime::machine::Machine,
        parent: Option<usize>,
    ) -> Arc<ThreadShared> {
        use crate::runtime::store::Ref;
        use crate::runtime::thread::ThreadRoots;

        let mut st = self.state.lock();
        let index = st.entries.len();
        let shared = Arc::new(ThreadShared {
            index,
            roots: parking_lot::Mutex::new(ThreadRoots {
                thread_obj: Ref::NULL,
                frame: Ref::NULL,
                code: Ref::NULL,
                exception: Ref::NULL,
                ip: 0,
                sp: 0,
                stack: vec![Ref::NULL; m.limits.stack_slots],
                heap_index: 0,
                protector: Vec::new(),
            }),
        });
        let mut entry = ThreadEntry {
            shared: Arc::clone(&shared),
            state: RunState::None,
            next: None,
            child: None,
        };
        match (st.root, parent) {
            (None, _) => {
                st.entries.push(entry);
                st.root = Some(index);
            }
            (Some(_), Some(p)) => {
                entry.next = st.entries[p].child;
                st.entries.push(entry);
                st.entries[p].child = Some(index);
            }
            (Some(root), None) => {
                entry.next = st.entries[root].next;
                st.entries.push(entry);
                st.entries[root].next = Some(index);
            }
        }
        shared
    }

    /// True when some thread holds or is acquiring exclusive mode. Benign
    /// to read racily; `enter` re-checks under the lock.
    pub fn exclusive_requested(&self) -> bool {
        self.state.lock().exclusive.is_some()
    }

    pub fn state_of(&self, index: usize) -> RunState {
        self.state.lock().entries[index].state
    }

    pub fn counts(&self) -> (u32, u32) {
        let st = self.state.lock();
        (st.active, st.live)
    }

    pub fn enter(&self, sys: &dyn System, index: usize, target: RunState) {
        let mut st = self.state.lock();
        self.enter_locked(&mut st, sys, index, target);
    }

    fn enter_locked(
        &self,
        st: &mut MutexGuard<'_, CoordState>,
        sys: &dyn System,
        index: usize,
        target: RunState,
    ) {
        if st.entries[index].state == target {
            return;
        }
        trace!(thread = index, from = ?st.entries[index].state, to = ?target, "state transition");

        match target {
            RunState::Exclusive => {
                if st.entries[index].state != RunState::Active {
                    sys.abort();
                }
                while st.exclusive.is_some() {
                    // another thread got here first
                    self.enter_locked(st, sys, index, RunState::Idle);
                    self.enter_locked(st, sys, index, RunState::Active);
                }
                st.entries[index].state = RunState::Exclusive;
                st.exclusive = Some(index);

                while st.active > 1 {
                    self.cond.wait(st);
                }
            }

            RunState::Idle | RunState::Zombie => {
                match st.entries[index].state {
                    RunState::Exclusive => {
                        if st.exclusive != Some(index) {
                            sys.abort();
                        }
                        st.exclusive = None;
                    }
                    RunState::Active => {}
                    _ => sys.abort(),
                }

                st.active -= 1;
                if target == RunState::Zombie {
                    st.live -= 1;
                }
                st.entries[index].state = target;

                self.cond.notify_all();
            }

            RunState::Active => match st.entries[index].state {
                RunState::Exclusive => {
                    if st.exclusive != Some(index) {
                        sys.abort();
                    }
                    st.entries[index].state = RunState::Active;
                    st.exclusive = None;

                    self.cond.notify_all();
                }

                RunState::None | RunState::Idle => {
                    while st.exclusive.is_some() {
                        self.cond.wait(st);
                    }

                    st.active += 1;
                    if st.entries[index].state == RunState::None {
                        st.live += 1;
                    }
                    st.entries[index].state = RunState::Active;
                }

                _ => sys.abort(),
            },

            RunState::Exit => {
                match st.entries[index].state {
                    RunState::Exclusive => {
                        if st.exclusive != Some(index) {
                            sys.abort();
                        }
                        st.exclusive = None;
                    }
                    RunState::Active => {}
                    _ => sys.abort(),
                }

                st.active -= 1;
                st.entries[index].state = RunState::Exit;

                while st.live > 1 {
                    self.cond.wait(st);
                }
            }

            RunState::None => sys.abort(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finder::MapClassFinder;
    use crate::gc::MarkSweep;
    use crate::runtime::machine::{Machine, PanicSystem};
    use crate::runtime::thread::Thread;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn machine() -> Arc<Machine> {
        Machine::new(
            Arc::new(PanicSystem),
            Arc::new(MarkSweep),
            Arc::new(MapClassFinder::new()),
        )
    }

    #[test]
    fn counts_track_the_transition_table() {
        let m = machine();
        let t = Thread::attach(&m, None);
        assert_eq!(m.coordinator.counts(), (0, 0));

        m.enter(&t, RunState::Active);
        assert_eq!(m.coordinator.counts(), (1, 1));
        assert!(!m.coordinator.exclusive_requested());

        m.enter(&t, RunState::Idle);
        assert_eq!(m.coordinator.counts(), (0, 1));

        m.enter(&t, RunState::Active);
        assert_eq!(m.coordinator.counts(), (1, 1));

        m.enter(&t, RunState::Zombie);
        assert_eq!(m.coordinator.counts(), (0, 0));
        assert_eq!(t.state(), RunState::Zombie);
    }

    #[test]
    fn reentering_the_same_state_is_a_no_op() {
        let m = machine();
        let t = Thread::attach(&m, None);
        m.enter(&t, RunState::Active);
        m.enter(&t, RunState::Active);
        assert_eq!(m.coordinator.counts(), (1, 1));
    }

    #[test]
    fn exclusive_holder_is_sole_active_thread() {
        let m = machine();
        let t = Thread::attach(&m, None);
        m.enter(&t, RunState::Active);
        m.enter(&t, RunState::Exclusive);
        assert_eq!(m.coordinator.counts(), (1, 1));
        assert!(m.coordinator.exclusive_requested());

        m.enter(&t, RunState::Active);
        assert!(!m.coordinator.exclusive_requested());
    }

    #[test]
    fn entering_active_blocks_while_another_thread_is_exclusive() {
        let m = machine();
        let a = Thread::attach(&m, None);
        m.enter(&a, RunState::Active);
        m.enter(&a, RunState::Exclusive);

        let entered = Arc::new(AtomicBool::new(false));
        let entered2 = Arc::clone(&entered);
        let m2 = Arc::clone(&m);
        let handle = std::thread::spawn(move || {
            let b = Thread::attach(&m2, None);
            m2.enter(&b, RunState::Active);
            entered2.store(true, Ordering::SeqCst);
            m2.enter(&b, RunState::Zombie);
        });

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst), "B must wait for exclusive");

        m.enter(&a, RunState::Active);
        handle.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    fn exit_waits_for_other_threads_to_finish() {
        let m = machine();
        let a = Thread::attach(&m, None);
        m.enter(&a, RunState::Active);

        let m2 = Arc::clone(&m);
        let handle = std::thread::spawn(move || {
            let b = Thread::attach(&m2, None);
            m2.enter(&b, RunState::Active);
            // blocks until A is the only live thread left
            m2.enter(&b, RunState::Exit);
        });

        // wait until B is live, then finish A
        while m.coordinator.counts().1 < 2 {
            std::thread::yield_now();
        }
        m.enter(&a, RunState::Zombie);
        handle.join().unwrap();
        assert_eq!(m.coordinator.counts(), (0, 1));
    }

    #[test]
    fn allocation_safe_point_parks_mutators_for_a_collection() {
        let m = machine();
        let a = Thread::attach(&m, None);
        m.enter(&a, RunState::Active);

        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = Arc::clone(&stop);
        let m2 = Arc::clone(&m);
        let handle = std::thread::spawn(move || {
            let b = Thread::attach(&m2, None);
            m2.enter(&b, RunState::Active);
            while !stop2.load(Ordering::SeqCst) {
                // every allocation is a safe-point
                b.alloc_int(1);
            }
            m2.enter(&b, RunState::Zombie);
        });

        while m.coordinator.counts().0 < 2 {
            std::thread::yield_now();
        }

        // blocks until B parks at its next allocation
        m.enter(&a, RunState::Exclusive);
        assert_eq!(m.coordinator.counts().0, 1);
        m.collect(crate::runtime::machine::CollectionKind::Minor);
        m.enter(&a, RunState::Active);

        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();

        assert_eq!(m.coordinator.counts(), (1, 1));
        assert_eq!(a.heap_index(), 0);
    }
}
