use std::fmt;

use crate::consts::{ClassAccessFlag, FieldAccessFlag, MethodAccessFlag};

/// Bytes per arena word, for allocation accounting.
pub const WORD: usize = 8;

/// Handle to a cell in the store. Zero is the null reference; any other
/// value addresses cell `value - 1`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ref(u32);

impl Ref {
    pub const NULL: Ref = Ref(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn from_index(index: usize) -> Ref {
        Ref(index as u32 + 1)
    }

    pub(crate) fn index(self) -> usize {
        debug_assert!(self.0 != 0, "dereferencing null");
        self.0 as usize - 1
    }
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

/// One row of an exception handler table. `catch_type` indexes the owning
/// code's constant pool; zero catches everything.
#[derive(Debug, Clone, Copy)]
pub struct HandlerEntry {
    pub start_ip: u16,
    pub end_ip: u16,
    pub handler_ip: u16,
    pub catch_type: u16,
}

#[derive(Debug)]
pub struct ClassCell {
    pub flags: ClassAccessFlag,
    /// Monotonic identity; interfaces draw from a separate counter.
    pub id: u32,
    /// Byte array holding the slash-separated name.
    pub name: Ref,
    /// Resolved superclass, or null for the root.
    pub super_class: Ref,
    /// Raw array of stride two: interface class, itable raw array.
    pub interface_table: Ref,
    /// Raw array of methods; a method's `offset` indexes this table.
    pub method_table: Ref,
    /// Raw array of fields, inherited entries first.
    pub field_table: Ref,
    /// Raw array backing static fields.
    pub static_table: Ref,
    /// Pair chain of initializer methods still to run, drained head-first.
    pub initializers: Ref,
    /// Instance field slot count, superclass prefix included.
    pub fixed_size: u32,
}

#[derive(Debug)]
pub struct FieldCell {
    pub flags: FieldAccessFlag,
    /// Slot index into the instance fields or the class static table.
    pub offset: u16,
    pub class: Ref,
    pub name: Ref,
    pub spec: Ref,
}

#[derive(Debug)]
pub struct MethodCell {
    pub flags: MethodAccessFlag,
    /// Index into the owning class's method table and any itable built
    /// against the owning interface.
    pub offset: u16,
    /// Operand slots consumed by a call, receiver included.
    pub parameter_count: u16,
    pub class: Ref,
    pub name: Ref,
    pub spec: Ref,
    pub code: Ref,
}

#[derive(Debug)]
pub struct CodeCell {
    pub max_stack: u16,
    pub max_locals: u16,
    pub body: Vec<u8>,
    /// Raw array of constants; slots are rewritten in place on resolution.
    pub pool: Ref,
    pub handlers: Vec<HandlerEntry>,
}

#[derive(Debug)]
pub struct FrameCell {
    pub method: Ref,
    pub next: Ref,
    /// Caller ip, saved on invoke.
    pub ip: u32,
    /// Operand stack depth on entry.
    pub stack_base: u32,
    pub locals: Vec<Ref>,
}

/// The tag-dispatched object universe. Reading a cell's variant recovers
/// the runtime type; instances and arrays carry their class in the header
/// position.
#[derive(Debug)]
pub enum Cell {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    ByteArray(Vec<i8>),
    BooleanArray(Vec<u8>),
    CharArray(Vec<u16>),
    ShortArray(Vec<i16>),
    IntArray(Vec<i32>),
    LongArray(Vec<i64>),
    FloatArray(Vec<f32>),
    DoubleArray(Vec<f64>),
    ObjectArray { class: Ref, body: Vec<Ref> },
    RawArray(Vec<Ref>),
    Instance { class: Ref, fields: Vec<Ref> },
    Class(Box<ClassCell>),
    Field(Box<FieldCell>),
    Method(Box<MethodCell>),
    Code(Box<CodeCell>),
    Frame(Box<FrameCell>),
    /// Symbolic member reference: class (byte array until resolved), member
    /// name, member spec.
    Reference { class: Ref, name: Ref, spec: Ref },
    Pair { first: Ref, second: Ref },
    Triple { first: Ref, second: Ref, third: Ref },
    /// One element of an exception backtrace.
    Trace { method: Ref, ip: u32, next: Ref },
    /// The per-thread object; holds the uncaught-exception handler method.
    ThreadObject { handler: Ref },
}

impl Cell {
    /// Calls `f` with every reference slot held inside this cell. The
    /// collector uses this both to trace and to rewrite interior slots.
    pub fn visit_refs(&mut self, f: &mut dyn FnMut(&mut Ref)) {
        match self {
            Cell::Int(_)
            | Cell::Long(_)
            | Cell::Float(_)
            | Cell::Double(_)
            | Cell::ByteArray(_)
            | Cell::BooleanArray(_)
            | Cell::CharArray(_)
            | Cell::ShortArray(_)
            | Cell::IntArray(_)
            | Cell::LongArray(_)
            | Cell::FloatArray(_)
            | Cell::DoubleArray(_) => {}
            Cell::ObjectArray { class, body } => {
                f(class);
                for slot in body {
                    f(slot);
                }
            }
            Cell::RawArray(body) => {
                for slot in body {
                    f(slot);
                }
            }
            Cell::Instance { class, fields } => {
                f(class);
                for slot in fields {
                    f(slot);
                }
            }
            Cell::Class(c) => {
                f(&mut c.name);
                f(&mut c.super_class);
                f(&mut c.interface_table);
                f(&mut c.method_table);
                f(&mut c.field_table);
                f(&mut c.static_table);
                f(&mut c.initializers);
            }
            Cell::Field(m) => {
                f(&mut m.class);
                f(&mut m.name);
                f(&mut m.spec);
            }
            Cell::Method(m) => {
                f(&mut m.class);
                f(&mut m.name);
                f(&mut m.spec);
                f(&mut m.code);
            }
            Cell::Code(c) => f(&mut c.pool),
            Cell::Frame(fr) => {
                f(&mut fr.method);
                f(&mut fr.next);
                for slot in &mut fr.locals {
                    f(slot);
                }
            }
            Cell::Reference { class, name, spec } => {
                f(class);
                f(name);
                f(spec);
            }
            Cell::Pair { first, second } => {
                f(first);
                f(second);
            }
            Cell::Triple {
                first,
                second,
                third,
            } => {
                f(first);
                f(second);
                f(third);
            }
            Cell::Trace { method, next, .. } => {
                f(method);
                f(next);
            }
            Cell::ThreadObject { handler } => f(handler),
        }
    }

    /// Arena words charged against the allocating thread's budget: one
    /// header word plus the payload.
    pub fn word_size(&self) -> usize {
        fn payload(bytes: usize) -> usize {
            1 + bytes.div_ceil(WORD)
        }
        match self {
            Cell::Int(_) | Cell::Float(_) => 2,
            Cell::Long(_) | Cell::Double(_) => 2,
            Cell::ByteArray(b) => payload(b.len()),
            Cell::BooleanArray(b) => payload(b.len()),
            Cell::CharArray(b) => payload(b.len() * 2),
            Cell::ShortArray(b) => payload(b.len() * 2),
            Cell::IntArray(b) => payload(b.len() * 4),
            Cell::LongArray(b) => payload(b.len() * 8),
            Cell::FloatArray(b) => payload(b.len() * 4),
            Cell::DoubleArray(b) => payload(b.len() * 8),
            Cell::ObjectArray { body, .. } => 2 + body.len(),
            Cell::RawArray(body) => 2 + body.len(),
            Cell::Instance { fields, .. } => 1 + fields.len(),
            Cell::Class(_) => 10,
            Cell::Field(_) => 5,
            Cell::Method(_) => 7,
            Cell::Code(c) => 3 + c.body.len().div_ceil(WORD) + c.handlers.len() * 2,
            Cell::Frame(fr) => 5 + fr.locals.len(),
            Cell::Reference { .. } => 4,
            Cell::Pair { .. } => 3,
            Cell::Triple { .. } => 4,
            Cell::Trace { .. } => 4,
            Cell::ThreadObject { .. } => 2,
        }
    }

    pub fn is_long_or_double(&self) -> bool {
        matches!(self, Cell::Long(_) | Cell::Double(_))
    }
}

/// Backing storage for the object universe. Freed ids are recycled so the
/// table stays dense across collections.
#[derive(Default)]
pub struct Store {
    cells: Vec<Option<Cell>>,
    free: Vec<u32>,
}

impl Store {
    pub fn new() -> Store {
        Store::default()
    }

    pub fn insert(&mut self, cell: Cell) -> Ref {
        if let Some(index) = self.free.pop() {
            debug_assert!(self.cells[index as usize].is_none());
            self.cells[index as usize] = Some(cell);
            Ref::from_index(index as usize)
        } else {
            self.cells.push(Some(cell));
            Ref::from_index(self.cells.len() - 1)
        }
    }

    pub fn get(&self, r: Ref) -> &Cell {
        self.cells[r.index()].as_ref().expect("freed cell")
    }

    pub fn get_mut(&mut self, r: Ref) -> &mut Cell {
        self.cells[r.index()].as_mut().expect("freed cell")
    }

    /// Releases a cell; the id goes back on the free list.
    pub fn release(&mut self, r: Ref) {
        let index = r.index();
        debug_assert!(self.cells[index].is_some());
        self.cells[index] = None;
        self.free.push(index as u32);
    }

    /// Removes a cell leaving its id reserved; a relocating collector
    /// calls `free_id` once every forwarded slot has been rewritten.
    pub fn take(&mut self, r: Ref) -> Cell {
        self.cells[r.index()].take().expect("freed cell")
    }

    pub fn free_id(&mut self, r: Ref) {
        let index = r.index();
        debug_assert!(self.cells[index].is_none());
        self.free.push(index as u32);
    }

    pub fn live_count(&self) -> usize {
        self.cells.len() - self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// All live references, in table order.
    pub fn refs(&self) -> impl Iterator<Item = Ref> + '_ {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_some())
            .map(|(i, _)| Ref::from_index(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_read_back() {
        let mut store = Store::new();
        let a = store.insert(Cell::Int(41));
        let b = store.insert(Cell::Long(7));
        assert!(matches!(store.get(a), Cell::Int(41)));
        assert!(matches!(store.get(b), Cell::Long(7)));
        assert_eq!(store.live_count(), 2);
    }

    #[test]
    fn released_ids_are_recycled() {
        let mut store = Store::new();
        let a = store.insert(Cell::Int(1));
        let _b = store.insert(Cell::Int(2));
        store.release(a);
        let c = store.insert(Cell::Int(3));
        assert_eq!(a, c);
        assert_eq!(store.capacity(), 2);
    }

    #[test]
    fn visit_refs_covers_pair_and_instance() {
        let mut store = Store::new();
        let a = store.insert(Cell::Int(0));
        let b = store.insert(Cell::Int(1));
        let mut cell = Cell::Instance {
            class: a,
            fields: vec![b, Ref::NULL],
        };
        let mut seen = vec![];
        cell.visit_refs(&mut |slot| seen.push(*slot));
        assert_eq!(seen, vec![a, b, Ref::NULL]);
    }

    #[test]
    fn word_sizes_scale_with_payload() {
        assert_eq!(Cell::Int(0).word_size(), 2);
        assert_eq!(Cell::ByteArray(vec![0; 8]).word_size(), 2);
        assert_eq!(Cell::ByteArray(vec![0; 9]).word_size(), 3);
        assert_eq!(Cell::IntArray(vec![0; 4]).word_size(), 3);
        assert_eq!(
            Cell::Instance {
                class: Ref::NULL,
                fields: vec![Ref::NULL; 3]
            }
            .word_size(),
            4
        );
    }
}
