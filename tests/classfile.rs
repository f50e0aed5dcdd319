//! End-to-end: hand-assembled class-file bytes go through the finder, the
//! parser, linking and the dispatch loop.

use std::sync::Arc;

use shrike::finder::MapClassFinder;
use shrike::gc::MarkSweep;
use shrike::{invoke, Machine, PanicSystem, RunState, Thread};

fn u16be(v: u16) -> [u8; 2] {
    v.to_be_bytes()
}

struct ClassWriter {
    pool: Vec<Vec<u8>>,
    bytes: Vec<u8>,
}

impl ClassWriter {
    fn new() -> ClassWriter {
        ClassWriter {
            pool: Vec::new(),
            bytes: Vec::new(),
        }
    }

    fn utf8(&mut self, s: &str) -> u16 {
        let mut entry = vec![1];
        entry.extend_from_slice(&u16be(s.len() as u16));
        entry.extend_from_slice(s.as_bytes());
        self.pool.push(entry);
        self.pool.len() as u16
    }

    fn class(&mut self, name: &str) -> u16 {
        let name_index = self.utf8(name);
        let mut entry = vec![7];
        entry.extend_from_slice(&u16be(name_index));
        self.pool.push(entry);
        self.pool.len() as u16
    }

    fn method_ref(&mut self, class_index: u16, name: &str, spec: &str) -> u16 {
        let name_index = self.utf8(name);
        let spec_index = self.utf8(spec);
        let mut nat = vec![12];
        nat.extend_from_slice(&u16be(name_index));
        nat.extend_from_slice(&u16be(spec_index));
        self.pool.push(nat);
        let nat_index = self.pool.len() as u16;

        let mut entry = vec![10];
        entry.extend_from_slice(&u16be(class_index));
        entry.extend_from_slice(&u16be(nat_index));
        self.pool.push(entry);
        self.pool.len() as u16
    }

    fn method(&mut self, name: &str, spec: &str, max_stack: u16, max_locals: u16, code: &[u8]) {
        let name_index = self.utf8(name);
        let spec_index = self.utf8(spec);
        let code_attr_name = self.utf8("Code");

        let mut body = Vec::new();
        body.extend_from_slice(&u16be(max_stack));
        body.extend_from_slice(&u16be(max_locals));
        body.extend_from_slice(&(code.len() as u32).to_be_bytes());
        body.extend_from_slice(code);
        body.extend_from_slice(&u16be(0)); // exception table
        body.extend_from_slice(&u16be(0)); // attributes

        self.bytes.extend_from_slice(&u16be(0x0008)); // static
        self.bytes.extend_from_slice(&u16be(name_index));
        self.bytes.extend_from_slice(&u16be(spec_index));
        self.bytes.extend_from_slice(&u16be(1));
        self.bytes.extend_from_slice(&u16be(code_attr_name));
        self.bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
        self.bytes.extend_from_slice(&body);
    }

    fn finish(self, this_class: u16, super_class: u16, method_count: u16) -> Vec<u8> {
        let mut out = vec![0xca, 0xfe, 0xba, 0xbe, 0, 0, 0, 52];
        out.extend_from_slice(&u16be(self.pool.len() as u16 + 1));
        for entry in &self.pool {
            out.extend_from_slice(entry);
        }
        out.extend_from_slice(&u16be(0x0021)); // public super
        out.extend_from_slice(&u16be(this_class));
        out.extend_from_slice(&u16be(super_class));
        out.extend_from_slice(&u16be(0)); // interfaces
        out.extend_from_slice(&u16be(0)); // fields
        out.extend_from_slice(&u16be(method_count));
        out.extend_from_slice(&self.bytes);
        out.extend_from_slice(&u16be(0)); // class attributes
        out
    }
}

fn calc_class() -> Vec<u8> {
    let mut w = ClassWriter::new();
    let this_class = w.class("Calc");
    let super_class = w.class("java/lang/Object");
    let fib_ref = w.method_ref(this_class, "fib", "(I)I");

    // add(a, b) = a + b
    w.method("add", "(II)I", 2, 2, &[0x1a, 0x1b, 0x60, 0xac]);

    // fib(n) = n < 2 ? n : fib(n - 1) + fib(n - 2)
    let fib_hi = (fib_ref >> 8) as u8;
    let fib_lo = fib_ref as u8;
    let code = [
        0x1a, // iload_0
        0x05, // iconst_2
        0xa2, 0x00, 0x05, // if_icmpge +5
        0x1a, // iload_0
        0xac, // ireturn
        0x1a, // iload_0
        0x04, // iconst_1
        0x64, // isub
        0xb8, fib_hi, fib_lo, // invokestatic fib
        0x1a, // iload_0
        0x05, // iconst_2
        0x64, // isub
        0xb8, fib_hi, fib_lo, // invokestatic fib
        0x60, // iadd
        0xac, // ireturn
    ];
    w.method("fib", "(I)I", 3, 1, &code);

    w.finish(this_class, super_class, 2)
}

fn boot() -> (Arc<Machine>, Thread) {
    let finder = MapClassFinder::new();
    finder.define("Calc", calc_class());
    let machine = Machine::new(Arc::new(PanicSystem), Arc::new(MarkSweep), Arc::new(finder));
    let thread = Thread::attach(&machine, None);
    machine.enter(&thread, RunState::Active);
    (machine, thread)
}

#[test]
fn loads_and_runs_a_static_method() {
    let (machine, thread) = boot();
    let class = thread.resolve_class(b"Calc").expect("Calc resolves");
    let add = machine.lookup_method(class, "add", "(II)I").expect("add exists");

    thread.push(thread.alloc_int(3));
    thread.push(thread.alloc_int(4));
    let result = invoke(&thread, add);
    assert_eq!(machine.int_value(result), 7);
    assert!(thread.pending_exception().is_null());
}

#[test]
fn recursive_calls_resolve_their_own_pool_entries() {
    let (machine, thread) = boot();
    let class = thread.resolve_class(b"Calc").expect("Calc resolves");
    let fib = machine.lookup_method(class, "fib", "(I)I").expect("fib exists");

    thread.push(thread.alloc_int(10));
    let result = invoke(&thread, fib);
    assert_eq!(machine.int_value(result), 55);
}

#[test]
fn resolution_is_idempotent_across_calls() {
    let (_machine, thread) = boot();
    let first = thread.resolve_class(b"Calc").expect("Calc resolves");
    let second = thread.resolve_class(b"Calc").expect("Calc resolves");
    assert_eq!(first, second);
}
