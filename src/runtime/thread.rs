use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::runtime::coordinator::RunState;
use crate::runtime::machine::{CollectionKind, ExcKind, Machine};
use crate::runtime::store::{Cell, Ref};

/// Marker for "an exception object has been installed in the thread's
/// exception register"; unwinding happens at the dispatch loop.
#[derive(Debug)]
pub(crate) struct Thrown;

pub(crate) type VmResult<T = ()> = Result<T, Thrown>;

/// The interpreter registers and GC roots of one thread. Owned by the
/// thread's mutex; the running thread holds the guard while executing and
/// releases it at every safe-point, which is what lets the collector walk
/// and rewrite these slots during exclusive mode.
pub(crate) struct ThreadRoots {
    pub thread_obj: Ref,
    pub frame: Ref,
    pub code: Ref,
    pub exception: Ref,
    pub ip: usize,
    pub sp: usize,
    pub stack: Vec<Ref>,
    /// Arena words consumed since the last collection.
    pub heap_index: usize,
    /// LIFO registration of refs that must survive helper-internal
    /// allocations; released in reverse acquisition order.
    pub protector: Vec<Ref>,
}

pub struct ThreadShared {
    pub(crate) index: usize,
    pub(crate) roots: Mutex<ThreadRoots>,
}

/// One execution context, bound to one OS thread by convention. Construction
/// registers it with the machine; `Machine::enter` moves it through the
/// state machine.
pub struct Thread {
    machine: Arc<Machine>,
    pub(crate) shared: Arc<ThreadShared>,
}

impl Thread {
    pub fn attach(machine: &Arc<Machine>, parent: Option<&Thread>) -> Thread {
        let shared = machine
            .coordinator
            .register_shared(machine, parent.map(|p| p.index()));
        Thread {
            machine: Arc::clone(machine),
            shared,
        }
    }

    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    pub fn index(&self) -> usize {
        self.shared.index
    }

    pub fn state(&self) -> RunState {
        self.machine.coordinator.state_of(self.shared.index)
    }

    /// Installs the thread object carrying the uncaught-exception handler.
    pub fn set_thread_object(&self, thread_obj: Ref) {
        self.shared.roots.lock().thread_obj = thread_obj;
    }

    pub fn pending_exception(&self) -> Ref {
        self.shared.roots.lock().exception
    }

    pub fn clear_exception(&self) {
        self.shared.roots.lock().exception = Ref::NULL;
    }

    /// Operand stack depth; the unit tests use it to check stack effects.
    pub fn sp(&self) -> usize {
        self.shared.roots.lock().sp
    }

    /// Arena words consumed since the last collection.
    pub fn heap_index(&self) -> usize {
        self.shared.roots.lock().heap_index
    }

    pub fn push(&self, value: Ref) {
        let mut roots = self.shared.roots.lock();
        let sp = roots.sp;
        self.machine.ensure(sp < roots.stack.len());
        roots.stack[sp] = value;
        roots.sp = sp + 1;
    }

    pub fn pop(&self) -> Ref {
        let mut roots = self.shared.roots.lock();
        self.machine.ensure(roots.sp > 0);
        roots.sp -= 1;
        roots.stack[roots.sp]
    }

    /// Allocates an int box. The thread must be Active: allocation is a
    /// safe-point.
    pub fn alloc_int(&self, value: i32) -> Ref {
        Mutator::new(&self.machine, &self.shared).alloc(Cell::Int(value))
    }

    pub fn alloc_long(&self, value: i64) -> Ref {
        Mutator::new(&self.machine, &self.shared).alloc(Cell::Long(value))
    }

    pub fn alloc_int_array(&self, values: &[i32]) -> Ref {
        Mutator::new(&self.machine, &self.shared).alloc(Cell::IntArray(values.to_vec()))
    }

    /// Resolves a class by slash-separated name, loading it through the
    /// machine's class finder on a miss. Returns None with the class-not-
    /// found exception left in the thread register on failure.
    pub fn resolve_class(&self, name: &[u8]) -> Option<Ref> {
        let mut mu = Mutator::new(&self.machine, &self.shared);
        match crate::runtime::loader::resolve_class(&mut mu, name) {
            Ok(class) => Some(class),
            Err(Thrown) => None,
        }
    }
}

/// Thread-side execution context: the machine plus the (re-acquirable)
/// guard over the thread's roots. Helpers that may yield drop the guard,
/// park, and take it back, so the roots are always observable while the
/// thread is not Active.
pub(crate) struct Mutator<'m> {
    pub m: &'m Machine,
    shared: &'m ThreadShared,
    guard: Option<MutexGuard<'m, ThreadRoots>>,
}

impl<'m> Mutator<'m> {
    pub fn new(m: &'m Machine, shared: &'m ThreadShared) -> Mutator<'m> {
        Mutator {
            m,
            shared,
            guard: Some(shared.roots.lock()),
        }
    }

    pub fn roots(&mut self) -> &mut ThreadRoots {
        self.guard.as_mut().expect("roots checked in at safe-point")
    }

    /// Parks through Idle and back to Active, releasing the roots so a
    /// collector can scan them meanwhile.
    pub fn yield_idle(&mut self) {
        self.guard = None;
        let coordinator = &self.m.coordinator;
        coordinator.enter(&*self.m.sys, self.shared.index, RunState::Idle);
        coordinator.enter(&*self.m.sys, self.shared.index, RunState::Active);
        self.guard = Some(self.shared.roots.lock());
    }

    /// Bump-allocates a cell against this thread's arena budget. The
    /// safe-point check runs first: an exclusive request or a full arena
    /// sends the thread through Idle and possibly a collection.
    pub fn alloc(&mut self, cell: Cell) -> Ref {
        let size = cell.word_size();
        let budget = self.m.limits.heap_words;
        let over = self.roots().heap_index + size > budget;
        if over || self.m.coordinator.exclusive_requested() {
            self.safe_point(size);
        }
        self.roots().heap_index += size;
        self.m.store.write().insert(cell)
    }

    fn safe_point(&mut self, size: usize) {
        if size > self.m.limits.heap_words {
            // large object support is out of scope
            self.m.fatal("allocation exceeds thread arena");
        }

        while self.m.coordinator.exclusive_requested() {
            // someone wants exclusive access; give them a chance
            self.yield_idle();
        }

        if self.roots().heap_index + size > self.m.limits.heap_words {
            self.guard = None;
            let coordinator = &self.m.coordinator;
            coordinator.enter(&*self.m.sys, self.shared.index, RunState::Exclusive);
            self.m.collect(CollectionKind::Minor);
            coordinator.enter(&*self.m.sys, self.shared.index, RunState::Active);
            self.guard = Some(self.shared.roots.lock());
        }
    }

    // operand stack

    pub fn push(&mut self, value: Ref) {
        let m = self.m;
        let roots = self.roots();
        let sp = roots.sp;
        if sp >= roots.stack.len() {
            m.fatal("operand stack exhausted");
        }
        roots.stack[sp] = value;
        roots.sp = sp + 1;
    }

    pub fn pop(&mut self) -> Ref {
        let m = self.m;
        let roots = self.roots();
        if roots.sp == 0 {
            m.fatal("operand stack underflow");
        }
        roots.sp -= 1;
        roots.stack[roots.sp]
    }

    fn roots_ref(&self) -> &ThreadRoots {
        self.guard.as_ref().expect("roots checked in at safe-point")
    }

    /// Slot `n` below the top without popping.
    pub fn peek(&self, n: usize) -> Ref {
        let roots = self.roots_ref();
        roots.stack[roots.sp - 1 - n]
    }

    pub fn set_top(&mut self, n: usize, value: Ref) {
        let roots = self.roots();
        let sp = roots.sp;
        roots.stack[sp - 1 - n] = value;
    }

    // protector chain

    pub fn protect(&mut self, value: Ref) -> usize {
        let roots = self.roots();
        roots.protector.push(value);
        roots.protector.len() - 1
    }

    pub fn protected(&self, slot: usize) -> Ref {
        self.roots_ref().protector[slot]
    }

    pub fn protect_depth(&self) -> usize {
        self.roots_ref().protector.len()
    }

    /// Releases protector registrations back to `depth`; scoped, reverse
    /// acquisition order.
    pub fn unprotect(&mut self, depth: usize) {
        let roots = self.roots();
        debug_assert!(roots.protector.len() >= depth);
        roots.protector.truncate(depth);
    }

    // allocating helpers

    pub fn make_int(&mut self, value: i32) -> Ref {
        self.alloc(Cell::Int(value))
    }

    pub fn make_long(&mut self, value: i64) -> Ref {
        self.alloc(Cell::Long(value))
    }

    pub fn make_bytes(&mut self, bytes: &[u8]) -> Ref {
        self.alloc(Cell::ByteArray(bytes.iter().map(|b| *b as i8).collect()))
    }

    pub fn make_string(&mut self, message: String) -> Ref {
        self.make_bytes(message.as_bytes())
    }

    /// Builds the (method, ip) backtrace chain for the current frame stack,
    /// outermost frame first. Non-destructive: walks a local cursor.
    pub fn make_trace(&mut self) -> Ref {
        let depth = self.protect_depth();
        let trace_slot = self.protect(Ref::NULL);

        let (frame, ip) = {
            let roots = self.roots();
            (roots.frame, roots.ip)
        };
        if !frame.is_null() {
            self.m.set_frame_ip(frame, ip);
        }

        let mut cursor = frame;
        while !cursor.is_null() {
            let method = self.m.frame_method(cursor);
            let frame_ip = self.m.frame_ip(cursor);
            let next = self.m.frame_next(cursor);
            let prev = self.protected(trace_slot);
            let node = self.alloc(Cell::Trace {
                method,
                ip: frame_ip as u32,
                next: prev,
            });
            let roots = self.roots();
            roots.protector[trace_slot] = node;
            cursor = next;
        }

        let trace = self.protected(trace_slot);
        self.unprotect(depth);
        trace
    }

    /// Synthesizes an exception instance: [message, trace] fields on the
    /// builtin class for `kind`.
    pub fn make_exception(&mut self, kind: ExcKind, message: Option<String>) -> Ref {
        let depth = self.protect_depth();
        let message = match message {
            Some(text) => self.make_string(text),
            None => Ref::NULL,
        };
        let message_slot = self.protect(message);
        let trace = self.make_trace();
        let trace_slot = self.protect(trace);

        let class = self.m.exception_class(kind);
        let fields = vec![self.protected(message_slot), self.protected(trace_slot)];
        let exception = self.alloc(Cell::Instance { class, fields });
        self.unprotect(depth);
        exception
    }

    /// Installs a fresh exception in the thread register.
    pub fn throw(&mut self, kind: ExcKind, message: Option<String>) -> Thrown {
        let exception = self.make_exception(kind, message);
        self.roots().exception = exception;
        Thrown
    }
}
