use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error};

use crate::consts::{ClassAccessFlag, MethodAccessFlag};
use crate::runtime::coordinator::{Coordinator, RunState};
use crate::runtime::loader;
use crate::runtime::opcodes;
use crate::runtime::store::{Cell, ClassCell, CodeCell, MethodCell, Ref, Store};
use crate::runtime::thread::Thread;

/// OS abstraction. Monitor construction cannot fail with parking_lot, so
/// only the fatal-tier sink remains.
pub trait System: Send + Sync {
    fn abort(&self) -> !;
}

/// Aborts the process. The default collaborator for production use.
pub struct HostSystem;

impl System for HostSystem {
    fn abort(&self) -> ! {
        std::process::abort()
    }
}

/// Panics instead of aborting, so tests can observe invariant violations.
pub struct PanicSystem;

impl System for PanicSystem {
    fn abort(&self) -> ! {
        panic!("vm abort")
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CollectionKind {
    Minor,
}

/// Receives every root slot by mutable reference so a moving collector can
/// rewrite it in place.
pub trait RootVisitor {
    fn visit(&mut self, slot: &mut Ref);
}

pub trait Roots {
    fn iterate(&mut self, visitor: &mut dyn RootVisitor);
}

/// The managed-memory collaborator. `collect` is invoked by the elected
/// thread while it holds exclusive mode; `check` is the write barrier,
/// called after every store into a heap-resident slot.
pub trait Heap: Send + Sync {
    fn collect(&self, kind: CollectionKind, store: &mut Store, roots: &mut dyn Roots);

    fn check(&self, container: Ref, value: Ref) {
        let _ = (container, value);
    }
}

/// Maps a slash-separated class name to class-file bytes.
pub trait ClassFinder: Send + Sync {
    fn find(&self, name: &[u8]) -> Option<Vec<u8>>;
}

#[derive(Clone, Copy, Debug)]
pub struct Limits {
    /// Per-thread arena budget, in words.
    pub heap_words: usize,
    /// Operand stack slots per thread.
    pub stack_slots: usize,
}

impl Default for Limits {
    fn default() -> Limits {
        Limits {
            heap_words: 64 * 1024,
            stack_slots: 64 * 1024,
        }
    }
}

/// Synthesized exception kinds, each backed by a builtin class.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExcKind {
    NullPointer,
    ArrayIndexOutOfBounds,
    NegativeArraySize,
    ClassCast,
    ClassNotFound,
    NoSuchField,
    NoSuchMethod,
    StackOverflow,
    Arithmetic,
}

/// Classes created at boot, before any class file is seen. All of these
/// are also registered in the class map under their names.
pub(crate) struct Builtins {
    pub object: Ref,
    pub string: Ref,
    pub throwable: Ref,
    pub null_pointer: Ref,
    pub array_index: Ref,
    pub negative_array_size: Ref,
    pub class_cast: Ref,
    pub class_not_found: Ref,
    pub no_such_field: Ref,
    pub no_such_method: Ref,
    pub stack_overflow: Ref,
    pub arithmetic: Ref,
    pub int: Ref,
    pub long: Ref,
    pub float: Ref,
    pub double: Ref,
    pub boolean_array: Ref,
    pub byte_array: Ref,
    pub char_array: Ref,
    pub short_array: Ref,
    pub int_array: Ref,
    pub long_array: Ref,
    pub float_array: Ref,
    pub double_array: Ref,
    pub object_array: Ref,
}

impl Builtins {
    fn visit(&mut self, visitor: &mut dyn RootVisitor) {
        for slot in [
            &mut self.object,
            &mut self.string,
            &mut self.throwable,
            &mut self.null_pointer,
            &mut self.array_index,
            &mut self.negative_array_size,
            &mut self.class_cast,
            &mut self.class_not_found,
            &mut self.no_such_field,
            &mut self.no_such_method,
            &mut self.stack_overflow,
            &mut self.arithmetic,
            &mut self.int,
            &mut self.long,
            &mut self.float,
            &mut self.double,
            &mut self.boolean_array,
            &mut self.byte_array,
            &mut self.char_array,
            &mut self.short_array,
            &mut self.int_array,
            &mut self.long_array,
            &mut self.float_array,
            &mut self.double_array,
            &mut self.object_array,
        ] {
            visitor.visit(slot);
        }
    }
}

pub(crate) struct ClassTable {
    /// In-heap hash map from name byte-array to class; a GC root.
    pub map: Ref,
    pub next_class_id: u32,
    pub next_interface_id: u32,
    pub builtins: Builtins,
}

const CLASS_MAP_BUCKETS: usize = 128;

/// Process-wide singleton: collaborators, the cell store, the thread
/// registry and the class table.
pub struct Machine {
    pub(crate) sys: Arc<dyn System>,
    pub(crate) heap: Arc<dyn Heap>,
    pub(crate) finder: Arc<dyn ClassFinder>,
    pub(crate) limits: Limits,
    pub(crate) store: RwLock<Store>,
    pub(crate) coordinator: Coordinator,
    /// Serializes class resolution end-to-end.
    pub(crate) class_lock: Mutex<()>,
    /// Map head, id counters and builtins; never held across an allocation.
    pub(crate) class_table: Mutex<ClassTable>,
}

impl Machine {
    pub fn new(
        sys: Arc<dyn System>,
        heap: Arc<dyn Heap>,
        finder: Arc<dyn ClassFinder>,
    ) -> Arc<Machine> {
        Machine::with_limits(sys, heap, finder, Limits::default())
    }

    pub fn with_limits(
        sys: Arc<dyn System>,
        heap: Arc<dyn Heap>,
        finder: Arc<dyn ClassFinder>,
        limits: Limits,
    ) -> Arc<Machine> {
        let mut store = Store::new();
        let map = store.insert(Cell::RawArray(vec![Ref::NULL; CLASS_MAP_BUCKETS]));

        let mut next_class_id = 0;
        let mut boot = |store: &mut Store, name: &str, super_class: Ref, fixed_size: u32| {
            let id = next_class_id;
            next_class_id += 1;
            boot_class(store, map, name, super_class, id, fixed_size)
        };

        let object = boot(&mut store, "java/lang/Object", Ref::NULL, 0);
        boot_object_constructor(&mut store, object);
        let string = boot(&mut store, "java/lang/String", object, 1);
        let throwable = boot(&mut store, "java/lang/Throwable", object, 2);
        let mut exc = |store: &mut Store, name: &str| boot(store, name, throwable, 2);
        let null_pointer = exc(&mut store, "java/lang/NullPointerException");
        let array_index = exc(&mut store, "java/lang/ArrayIndexOutOfBoundsException");
        let negative_array_size = exc(&mut store, "java/lang/NegativeArraySizeException");
        let class_cast = exc(&mut store, "java/lang/ClassCastException");
        let class_not_found = exc(&mut store, "java/lang/ClassNotFoundException");
        let no_such_field = exc(&mut store, "java/lang/NoSuchFieldError");
        let no_such_method = exc(&mut store, "java/lang/NoSuchMethodError");
        let stack_overflow = exc(&mut store, "java/lang/StackOverflowError");
        let arithmetic = exc(&mut store, "java/lang/ArithmeticException");
        let int = boot(&mut store, "int", Ref::NULL, 0);
        let long = boot(&mut store, "long", Ref::NULL, 0);
        let float = boot(&mut store, "float", Ref::NULL, 0);
        let double = boot(&mut store, "double", Ref::NULL, 0);
        let boolean_array = boot(&mut store, "[Z", object, 0);
        let byte_array = boot(&mut store, "[B", object, 0);
        let char_array = boot(&mut store, "[C", object, 0);
        let short_array = boot(&mut store, "[S", object, 0);
        let int_array = boot(&mut store, "[I", object, 0);
        let long_array = boot(&mut store, "[J", object, 0);
        let float_array = boot(&mut store, "[F", object, 0);
        let double_array = boot(&mut store, "[D", object, 0);
        let object_array = boot(&mut store, "[Ljava/lang/Object;", object, 0);

        let builtins = Builtins {
            object,
            string,
            throwable,
            null_pointer,
            array_index,
            negative_array_size,
            class_cast,
            class_not_found,
            no_such_field,
            no_such_method,
            stack_overflow,
            arithmetic,
            int,
            long,
            float,
            double,
            boolean_array,
            byte_array,
            char_array,
            short_array,
            int_array,
            long_array,
            float_array,
            double_array,
            object_array,
        };

        Arc::new(Machine {
            sys,
            heap,
            finder,
            limits,
            store: RwLock::new(store),
            coordinator: Coordinator::new(),
            class_lock: Mutex::new(()),
            class_table: Mutex::new(ClassTable {
                map,
                next_class_id,
                next_interface_id: 0,
                builtins,
            }),
        })
    }

    pub fn enter(&self, thread: &Thread, state: RunState) {
        self.coordinator.enter(&*self.sys, thread.index(), state);
    }

    pub(crate) fn fatal(&self, message: &str) -> ! {
        error!("fatal vm error: {message}");
        self.sys.abort()
    }

    pub(crate) fn ensure(&self, condition: bool) {
        if !condition {
            self.fatal("invariant violated");
        }
    }

    /// Runs a collection. Called with the calling thread in Exclusive mode;
    /// the coordinator guarantees every other thread is parked, so their
    /// root locks are free.
    pub(crate) fn collect(&self, kind: CollectionKind) {
        let mut store = self.store.write();
        let state = self.coordinator.state.lock();
        debug!(live = store.live_count(), "collection starting");
        let mut roots = MachineRoots {
            coordinator: &*state,
            class_table: &self.class_table,
        };
        self.heap.collect(kind, &mut store, &mut roots);
        debug!(live = store.live_count(), "collection done");
    }

    pub(crate) fn exception_class(&self, kind: ExcKind) -> Ref {
        let table = self.class_table.lock();
        let b = &table.builtins;
        match kind {
            ExcKind::NullPointer => b.null_pointer,
            ExcKind::ArrayIndexOutOfBounds => b.array_index,
            ExcKind::NegativeArraySize => b.negative_array_size,
            ExcKind::ClassCast => b.class_cast,
            ExcKind::ClassNotFound => b.class_not_found,
            ExcKind::NoSuchField => b.no_such_field,
            ExcKind::NoSuchMethod => b.no_such_method,
            ExcKind::StackOverflow => b.stack_overflow,
            ExcKind::Arithmetic => b.arithmetic,
        }
    }

    pub(crate) fn builtin(&self, pick: impl FnOnce(&Builtins) -> Ref) -> Ref {
        pick(&self.class_table.lock().builtins)
    }

    // typed views over cells

    pub(crate) fn with_cell<R>(&self, r: Ref, f: impl FnOnce(&Cell) -> R) -> R {
        f(self.store.read().get(r))
    }

    pub fn int_value(&self, r: Ref) -> i32 {
        match self.store.read().get(r) {
            Cell::Int(v) => *v,
            _ => self.fatal("int box expected"),
        }
    }

    pub fn long_value(&self, r: Ref) -> i64 {
        match self.store.read().get(r) {
            Cell::Long(v) => *v,
            _ => self.fatal("long box expected"),
        }
    }

    pub(crate) fn is_long_or_double(&self, r: Ref) -> bool {
        !r.is_null() && self.store.read().get(r).is_long_or_double()
    }

    /// The class header of an object; builtin classes for boxes and arrays.
    pub(crate) fn class_of(&self, r: Ref) -> Ref {
        let cell_class = {
            let store = self.store.read();
            match store.get(r) {
                Cell::Instance { class, .. } => Some(*class),
                Cell::Class(_) => None,
                _ => None,
            }
        };
        if let Some(class) = cell_class {
            return class;
        }
        let table = self.class_table.lock();
        let b = &table.builtins;
        let store = self.store.read();
        match store.get(r) {
            Cell::Int(_) => b.int,
            Cell::Long(_) => b.long,
            Cell::Float(_) => b.float,
            Cell::Double(_) => b.double,
            Cell::BooleanArray(_) => b.boolean_array,
            Cell::ByteArray(_) => b.byte_array,
            Cell::CharArray(_) => b.char_array,
            Cell::ShortArray(_) => b.short_array,
            Cell::IntArray(_) => b.int_array,
            Cell::LongArray(_) => b.long_array,
            Cell::FloatArray(_) => b.float_array,
            Cell::DoubleArray(_) => b.double_array,
            Cell::ObjectArray { .. } => b.object_array,
            _ => b.object,
        }
    }

    pub(crate) fn with_class<R>(&self, class: Ref, f: impl FnOnce(&ClassCell) -> R) -> R {
        match self.store.read().get(class) {
            Cell::Class(c) => f(c),
            _ => self.fatal("class expected"),
        }
    }

    pub(crate) fn class_super(&self, class: Ref) -> Ref {
        self.with_class(class, |c| c.super_class)
    }

    pub(crate) fn class_id(&self, class: Ref) -> u32 {
        self.with_class(class, |c| c.id)
    }

    pub(crate) fn class_flags(&self, class: Ref) -> ClassAccessFlag {
        self.with_class(class, |c| c.flags)
    }

    pub(crate) fn class_name(&self, class: Ref) -> Ref {
        self.with_class(class, |c| c.name)
    }

    pub(crate) fn class_fixed_size(&self, class: Ref) -> usize {
        self.with_class(class, |c| c.fixed_size as usize)
    }

    pub(crate) fn class_initializers(&self, class: Ref) -> Ref {
        self.with_class(class, |c| c.initializers)
    }

    pub(crate) fn class_method_table(&self, class: Ref) -> Ref {
        self.with_class(class, |c| c.method_table)
    }

    pub(crate) fn class_field_table(&self, class: Ref) -> Ref {
        self.with_class(class, |c| c.field_table)
    }

    pub(crate) fn class_static_table(&self, class: Ref) -> Ref {
        self.with_class(class, |c| c.static_table)
    }

    pub(crate) fn class_interface_table(&self, class: Ref) -> Ref {
        self.with_class(class, |c| c.interface_table)
    }

    fn set_class_slot(&self, class: Ref, value: Ref, f: impl FnOnce(&mut ClassCell, Ref)) {
        {
            let mut store = self.store.write();
            match store.get_mut(class) {
                Cell::Class(c) => f(c, value),
                _ => self.fatal("class expected"),
            }
        }
        self.heap.check(class, value);
    }

    pub(crate) fn set_class_method_table(&self, class: Ref, value: Ref) {
        self.set_class_slot(class, value, |c, v| c.method_table = v);
    }

    pub(crate) fn set_class_field_table(&self, class: Ref, value: Ref) {
        self.set_class_slot(class, value, |c, v| c.field_table = v);
    }

    pub(crate) fn set_class_static_table(&self, class: Ref, value: Ref) {
        self.set_class_slot(class, value, |c, v| c.static_table = v);
    }

    pub(crate) fn set_class_interface_table(&self, class: Ref, value: Ref) {
        self.set_class_slot(class, value, |c, v| c.interface_table = v);
    }

    pub(crate) fn set_class_fixed_size(&self, class: Ref, fixed_size: u32) {
        let mut store = self.store.write();
        match store.get_mut(class) {
            Cell::Class(c) => c.fixed_size = fixed_size,
            _ => self.fatal("class expected"),
        }
    }

    pub(crate) fn set_class_initializers(&self, class: Ref, value: Ref) {
        {
            let mut store = self.store.write();
            match store.get_mut(class) {
                Cell::Class(c) => c.initializers = value,
                _ => self.fatal("class expected"),
            }
        }
        self.heap.check(class, value);
    }

    pub(crate) fn method_class(&self, method: Ref) -> Ref {
        match self.store.read().get(method) {
            Cell::Method(m) => m.class,
            _ => self.fatal("method expected"),
        }
    }

    pub(crate) fn method_name(&self, method: Ref) -> Ref {
        match self.store.read().get(method) {
            Cell::Method(m) => m.name,
            _ => self.fatal("method expected"),
        }
    }

    pub(crate) fn method_spec(&self, method: Ref) -> Ref {
        match self.store.read().get(method) {
            Cell::Method(m) => m.spec,
            _ => self.fatal("method expected"),
        }
    }

    pub(crate) fn method_code(&self, method: Ref) -> Ref {
        match self.store.read().get(method) {
            Cell::Method(m) => m.code,
            _ => self.fatal("method expected"),
        }
    }

    pub(crate) fn method_offset(&self, method: Ref) -> usize {
        match self.store.read().get(method) {
            Cell::Method(m) => m.offset as usize,
            _ => self.fatal("method expected"),
        }
    }

    pub fn method_parameter_count(&self, method: Ref) -> usize {
        match self.store.read().get(method) {
            Cell::Method(m) => m.parameter_count as usize,
            _ => self.fatal("method expected"),
        }
    }

    pub(crate) fn field_class(&self, field: Ref) -> Ref {
        match self.store.read().get(field) {
            Cell::Field(f) => f.class,
            _ => self.fatal("field expected"),
        }
    }

    pub(crate) fn field_offset(&self, field: Ref) -> usize {
        match self.store.read().get(field) {
            Cell::Field(f) => f.offset as usize,
            _ => self.fatal("field expected"),
        }
    }

    pub(crate) fn code_byte(&self, code: Ref, ip: usize) -> u8 {
        match self.store.read().get(code) {
            Cell::Code(c) => c.body[ip],
            _ => self.fatal("code expected"),
        }
    }

    pub(crate) fn code_max_stack(&self, code: Ref) -> usize {
        match self.store.read().get(code) {
            Cell::Code(c) => c.max_stack as usize,
            _ => self.fatal("code expected"),
        }
    }

    pub(crate) fn code_max_locals(&self, code: Ref) -> usize {
        match self.store.read().get(code) {
            Cell::Code(c) => c.max_locals as usize,
            _ => self.fatal("code expected"),
        }
    }

    pub(crate) fn code_pool(&self, code: Ref) -> Ref {
        match self.store.read().get(code) {
            Cell::Code(c) => c.pool,
            _ => self.fatal("code expected"),
        }
    }

    pub(crate) fn code_handlers(&self, code: Ref) -> Vec<crate::runtime::store::HandlerEntry> {
        match self.store.read().get(code) {
            Cell::Code(c) => c.handlers.clone(),
            _ => self.fatal("code expected"),
        }
    }

    pub(crate) fn frame_method(&self, frame: Ref) -> Ref {
        match self.store.read().get(frame) {
            Cell::Frame(f) => f.method,
            _ => self.fatal("frame expected"),
        }
    }

    pub(crate) fn frame_next(&self, frame: Ref) -> Ref {
        match self.store.read().get(frame) {
            Cell::Frame(f) => f.next,
            _ => self.fatal("frame expected"),
        }
    }

    pub(crate) fn frame_ip(&self, frame: Ref) -> usize {
        match self.store.read().get(frame) {
            Cell::Frame(f) => f.ip as usize,
            _ => self.fatal("frame expected"),
        }
    }

    pub(crate) fn frame_stack_base(&self, frame: Ref) -> usize {
        match self.store.read().get(frame) {
            Cell::Frame(f) => f.stack_base as usize,
            _ => self.fatal("frame expected"),
        }
    }

    pub(crate) fn set_frame_ip(&self, frame: Ref, ip: usize) {
        let mut store = self.store.write();
        match store.get_mut(frame) {
            Cell::Frame(f) => f.ip = ip as u32,
            _ => self.fatal("frame expected"),
        }
    }

    pub(crate) fn frame_local(&self, frame: Ref, index: usize) -> Ref {
        match self.store.read().get(frame) {
            Cell::Frame(f) => f.locals[index],
            _ => self.fatal("frame expected"),
        }
    }

    pub(crate) fn set_frame_local(&self, frame: Ref, index: usize, value: Ref) {
        {
            let mut store = self.store.write();
            match store.get_mut(frame) {
                Cell::Frame(f) => f.locals[index] = value,
                _ => self.fatal("frame expected"),
            }
        }
        self.heap.check(frame, value);
    }

    pub(crate) fn raw_len(&self, array: Ref) -> usize {
        match self.store.read().get(array) {
            Cell::RawArray(body) => body.len(),
            _ => self.fatal("raw array expected"),
        }
    }

    pub(crate) fn raw_get(&self, array: Ref, index: usize) -> Ref {
        match self.store.read().get(array) {
            Cell::RawArray(body) => body[index],
            _ => self.fatal("raw array expected"),
        }
    }

    pub(crate) fn raw_set(&self, array: Ref, index: usize, value: Ref) {
        {
            let mut store = self.store.write();
            match store.get_mut(array) {
                Cell::RawArray(body) => body[index] = value,
                _ => self.fatal("raw array expected"),
            }
        }
        self.heap.check(array, value);
    }

    pub(crate) fn instance_field(&self, instance: Ref, index: usize) -> Ref {
        match self.store.read().get(instance) {
            Cell::Instance { fields, .. } => fields[index],
            _ => self.fatal("instance expected"),
        }
    }

    pub(crate) fn set_instance_field(&self, instance: Ref, index: usize, value: Ref) {
        {
            let mut store = self.store.write();
            match store.get_mut(instance) {
                Cell::Instance { fields, .. } => fields[index] = value,
                _ => self.fatal("instance expected"),
            }
        }
        self.heap.check(instance, value);
    }

    pub(crate) fn field_parts(&self, field: Ref) -> (Ref, Ref, Ref) {
        match self.store.read().get(field) {
            Cell::Field(f) => (f.class, f.name, f.spec),
            _ => self.fatal("field expected"),
        }
    }

    pub(crate) fn reference_parts(&self, reference: Ref) -> (Ref, Ref, Ref) {
        match self.store.read().get(reference) {
            Cell::Reference { class, name, spec } => (*class, *name, *spec),
            _ => self.fatal("symbolic reference expected"),
        }
    }

    pub(crate) fn set_reference_class(&self, reference: Ref, value: Ref) {
        {
            let mut store = self.store.write();
            match store.get_mut(reference) {
                Cell::Reference { class, .. } => *class = value,
                _ => self.fatal("symbolic reference expected"),
            }
        }
        self.heap.check(reference, value);
    }

    /// Byte-array contents as unsigned bytes.
    pub(crate) fn bytes_vec(&self, r: Ref) -> Vec<u8> {
        match self.store.read().get(r) {
            Cell::ByteArray(b) => b.iter().map(|v| *v as u8).collect(),
            _ => self.fatal("byte array expected"),
        }
    }

    pub(crate) fn pair_parts(&self, pair: Ref) -> (Ref, Ref) {
        match self.store.read().get(pair) {
            Cell::Pair { first, second } => (*first, *second),
            _ => self.fatal("pair expected"),
        }
    }

    pub(crate) fn triple_parts(&self, triple: Ref) -> (Ref, Ref, Ref) {
        match self.store.read().get(triple) {
            Cell::Triple {
                first,
                second,
                third,
            } => (*first, *second, *third),
            _ => self.fatal("triple expected"),
        }
    }

    /// Element count of any array cell.
    pub(crate) fn array_length(&self, array: Ref) -> usize {
        match self.store.read().get(array) {
            Cell::ByteArray(b) => b.len(),
            Cell::BooleanArray(b) => b.len(),
            Cell::CharArray(b) => b.len(),
            Cell::ShortArray(b) => b.len(),
            Cell::IntArray(b) => b.len(),
            Cell::LongArray(b) => b.len(),
            Cell::FloatArray(b) => b.len(),
            Cell::DoubleArray(b) => b.len(),
            Cell::ObjectArray { body, .. } => body.len(),
            Cell::RawArray(body) => body.len(),
            _ => self.fatal("array expected"),
        }
    }

    pub(crate) fn bytes_eq(&self, a: Ref, b: Ref) -> bool {
        if a == b {
            return true;
        }
        let store = self.store.read();
        match (store.get(a), store.get(b)) {
            (Cell::ByteArray(x), Cell::ByteArray(y)) => x == y,
            _ => false,
        }
    }

    pub(crate) fn bytes_eq_slice(&self, a: Ref, bytes: &[u8]) -> bool {
        match self.store.read().get(a) {
            Cell::ByteArray(x) => {
                x.len() == bytes.len() && x.iter().zip(bytes).all(|(l, r)| *l as u8 == *r)
            }
            _ => false,
        }
    }

    /// Lossy UTF-8 view of a byte array, for messages and diagnostics.
    pub(crate) fn bytes_string(&self, r: Ref) -> String {
        match self.store.read().get(r) {
            Cell::ByteArray(b) => {
                String::from_utf8_lossy(&b.iter().map(|v| *v as u8).collect::<Vec<_>>()).into_owned()
            }
            _ => String::new(),
        }
    }

    /// `instanceof` semantics: interfaces scan each superclass's interface
    /// table by interface id, classes walk the superclass chain by class id.
    pub(crate) fn instance_of(&self, class: Ref, object: Ref) -> bool {
        if object.is_null() {
            return false;
        }
        if self.class_flags(class).contains(ClassAccessFlag::INTERFACE) {
            let id = self.class_id(class);
            let mut oc = self.class_of(object);
            while !oc.is_null() {
                let itable = self.class_interface_table(oc);
                if !itable.is_null() {
                    let len = self.raw_len(itable);
                    let mut i = 0;
                    while i < len {
                        if self.class_id(self.raw_get(itable, i)) == id {
                            return true;
                        }
                        i += 2;
                    }
                }
                oc = self.class_super(oc);
            }
        } else {
            let id = self.class_id(class);
            let mut oc = self.class_of(object);
            while !oc.is_null() {
                if self.class_id(oc) == id {
                    return true;
                }
                oc = self.class_super(oc);
            }
        }
        false
    }

    /// True when `class` is a strict superclass of `base`.
    pub(crate) fn is_superclass(&self, class: Ref, base: Ref) -> bool {
        let id = self.class_id(class);
        let mut oc = self.class_super(base);
        while !oc.is_null() {
            if self.class_id(oc) == id {
                return true;
            }
            oc = self.class_super(oc);
        }
        false
    }

    // host-facing helpers

    /// Scans a class's method table for (name, spec), byte-for-byte.
    pub fn lookup_method(&self, class: Ref, name: &str, spec: &str) -> Option<Ref> {
        let table = self.class_method_table(class);
        let len = self.raw_len(table);
        for i in 0..len {
            let method = self.raw_get(table, i);
            if self.bytes_eq_slice(self.method_name(method), name.as_bytes())
                && self.bytes_eq_slice(self.method_spec(method), spec.as_bytes())
            {
                return Some(method);
            }
        }
        None
    }

    /// Name of an object's class, for assertions and diagnostics.
    pub fn class_name_of(&self, object: Ref) -> Option<String> {
        if object.is_null() {
            return None;
        }
        let class = self.class_of(object);
        Some(self.bytes_string(self.class_name(class)))
    }

    /// Message text of an exception instance, if it carries one.
    pub fn exception_message(&self, exception: Ref) -> Option<String> {
        if exception.is_null() {
            return None;
        }
        let message = self.instance_field(exception, 0);
        if message.is_null() {
            None
        } else {
            Some(self.bytes_string(message))
        }
    }
}

fn boot_class(
    store: &mut Store,
    map: Ref,
    name: &str,
    super_class: Ref,
    id: u32,
    fixed_size: u32,
) -> Ref {
    let name_ref = store.insert(Cell::ByteArray(name.bytes().map(|b| b as i8).collect()));
    let method_table = store.insert(Cell::RawArray(Vec::new()));
    let field_table = store.insert(Cell::RawArray(Vec::new()));
    let static_table = store.insert(Cell::RawArray(Vec::new()));
    let interface_table = store.insert(Cell::RawArray(Vec::new()));
    let class = store.insert(Cell::Class(Box::new(ClassCell {
        flags: ClassAccessFlag::PUBLIC,
        id,
        name: name_ref,
        super_class,
        interface_table,
        method_table,
        field_table,
        static_table,
        initializers: Ref::NULL,
        fixed_size,
    })));

    // register under the class's name so user classes may extend it
    let hash = loader::hash_bytes(name.as_bytes());
    let bucket = hash as usize & (CLASS_MAP_BUCKETS - 1);
    let head = match store.get(map) {
        Cell::RawArray(body) => body[bucket],
        _ => unreachable!("map is a raw array"),
    };
    let node = store.insert(Cell::Triple {
        first: name_ref,
        second: class,
        third: head,
    });
    match store.get_mut(map) {
        Cell::RawArray(body) => body[bucket] = node,
        _ => unreachable!("map is a raw array"),
    }
    class
}

/// java/lang/Object gets a no-op constructor so subclasses can chain into
/// it through `invokespecial`.
fn boot_object_constructor(store: &mut Store, object: Ref) {
    let pool = store.insert(Cell::RawArray(Vec::new()));
    let code = store.insert(Cell::Code(Box::new(CodeCell {
        max_stack: 0,
        max_locals: 1,
        body: vec![opcodes::RETURN],
        pool,
        handlers: Vec::new(),
    })));
    let name = store.insert(Cell::ByteArray(b"<init>".iter().map(|b| *b as i8).collect()));
    let spec = store.insert(Cell::ByteArray(b"()V".iter().map(|b| *b as i8).collect()));
    let method = store.insert(Cell::Method(Box::new(MethodCell {
        flags: MethodAccessFlag::PUBLIC,
        offset: 0,
        parameter_count: 1,
        class: object,
        name,
        spec,
        code,
    })));
    let method_table = match store.get(object) {
        Cell::Class(c) => c.method_table,
        _ => unreachable!("object is a class"),
    };
    match store.get_mut(method_table) {
        Cell::RawArray(body) => body.push(method),
        _ => unreachable!("method table is a raw array"),
    }
}

/// The global root set: the class table, then every registered thread's
/// registers, live stack slots, protector chain and children, depth first.
/// Each thread's arena budget resets as its roots are visited.
pub(crate) struct MachineRoots<'a> {
    pub coordinator: &'a crate::runtime::coordinator::CoordState,
    pub class_table: &'a Mutex<ClassTable>,
}

impl Roots for MachineRoots<'_> {
    fn iterate(&mut self, visitor: &mut dyn RootVisitor) {
        {
            let mut table = self.class_table.lock();
            visitor.visit(&mut table.map);
            table.builtins.visit(visitor);
        }

        let mut cursor = self.coordinator.root;
        while let Some(index) = cursor {
            visit_thread(self.coordinator, index, visitor);
            cursor = self.coordinator.entries[index].next;
        }
    }
}

fn visit_thread(
    state: &crate::runtime::coordinator::CoordState,
    index: usize,
    visitor: &mut dyn RootVisitor,
) {
    let entry = &state.entries[index];
    {
        let mut roots = entry.shared.roots.lock();
        roots.heap_index = 0;

        visitor.visit(&mut roots.thread_obj);
        visitor.visit(&mut roots.frame);
        visitor.visit(&mut roots.code);
        visitor.visit(&mut roots.exception);

        let sp = roots.sp;
        for i in 0..sp {
            visitor.visit(&mut roots.stack[i]);
        }

        for slot in roots.protector.iter_mut() {
            visitor.visit(slot);
        }
    }

    let mut child = entry.child;
    while let Some(c) = child {
        visit_thread(state, c, visitor);
        child = state.entries[c].next;
    }
}
