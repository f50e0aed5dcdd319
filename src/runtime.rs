mod coordinator;
mod interpreter;
mod loader;
mod machine;
mod opcodes;
mod store;
mod thread;

pub use coordinator::RunState;
pub use interpreter::{invoke, run};
pub use machine::{
    ClassFinder, CollectionKind, ExcKind, Heap, HostSystem, Limits, Machine, PanicSystem, Roots,
    RootVisitor, System,
};
pub use store::{Cell, Ref, Store};
pub use thread::Thread;
