//! A cooperative, stack-based class-file virtual machine.
//!
//! The machine parses class files on demand, resolves symbolic references
//! lazily against a pluggable class finder, accounts allocation against
//! per-thread arena budgets with stop-the-world collection, coordinates
//! threads through a small state machine, and dispatches the class-file
//! instruction set with exception propagation through frame handler
//! tables.
//!
//! ```no_run
//! use std::sync::Arc;
//! use shrike::{finder::DirClassFinder, gc::MarkSweep, HostSystem, Machine, RunState, Thread};
//!
//! let machine = Machine::new(
//!     Arc::new(HostSystem),
//!     Arc::new(MarkSweep),
//!     Arc::new(DirClassFinder::new("classes")),
//! );
//! let thread = Thread::attach(&machine, None);
//! machine.enter(&thread, RunState::Active);
//! let class = thread.resolve_class(b"com/example/Main").expect("class loads");
//! let main = machine.lookup_method(class, "main", "()I").expect("method exists");
//! let result = shrike::invoke(&thread, main);
//! println!("returned {}", machine.int_value(result));
//! ```

pub mod class;
pub mod consts;
pub mod descriptor;
pub mod finder;
pub mod gc;
mod runtime;

pub use runtime::{
    invoke, run, Cell, ClassFinder, CollectionKind, ExcKind, Heap, HostSystem, Limits, Machine,
    PanicSystem, Ref, Roots, RootVisitor, RunState, Store, System, Thread,
};
