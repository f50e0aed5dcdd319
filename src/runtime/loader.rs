use tracing::debug;

use crate::class::{self, ClassFile, CpInfo};
use crate::consts::{ClassAccessFlag, FieldAccessFlag, MethodAccessFlag};
use crate::descriptor::parse_method_descriptor;
use crate::runtime::machine::ExcKind;
use crate::runtime::store::{Cell, ClassCell, CodeCell, FieldCell, HandlerEntry, MethodCell, Ref};
use crate::runtime::thread::{Mutator, VmResult};

/// Name hash, h = h * 31 + byte, with the byte sign-extended as the
/// original byte-array element type is signed.
pub(crate) fn hash_bytes(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(*b as i8 as i32 as u32))
}

/// Probes the in-heap class map: buckets are triple chains of
/// (name, class, next).
pub(crate) fn hash_map_find(
    m: &crate::runtime::machine::Machine,
    map: Ref,
    hash: u32,
    key: &[u8],
) -> Option<Ref> {
    let buckets = m.raw_len(map);
    let mut node = m.raw_get(map, hash as usize & (buckets - 1));
    while !node.is_null() {
        let (name, class, next) = m.triple_parts(node);
        if m.bytes_eq_slice(name, key) {
            return Some(class);
        }
        node = next;
    }
    None
}

/// Chains a new (key, value) triple onto its bucket. Side-effecting only;
/// the caller keeps key and value protected across the node allocation.
pub(crate) fn hash_map_insert(mu: &mut Mutator<'_>, map: Ref, hash: u32, key: Ref, value: Ref) {
    let m = mu.m;
    let buckets = m.raw_len(map);
    let index = hash as usize & (buckets - 1);
    let head = m.raw_get(map, index);
    let node = mu.alloc(Cell::Triple {
        first: key,
        second: value,
        third: head,
    });
    m.raw_set(map, index, node);
}

/// Resolves a class by name: map probe first, then class finder, parse and
/// link. Serialized by the machine's class lock; waiting for the lock is a
/// safe-point so a blocked resolver cannot stall a collection.
pub(crate) fn resolve_class(mu: &mut Mutator<'_>, name: &[u8]) -> VmResult<Ref> {
    let m = mu.m;
    let guard = loop {
        match m.class_lock.try_lock() {
            Some(guard) => break guard,
            None => {
                mu.yield_idle();
                std::thread::yield_now();
            }
        }
    };
    let depth = mu.protect_depth();
    let result = resolve_class_locked(mu, name);
    // failed loads bail out mid-link; drop their protector registrations
    mu.unprotect(depth);
    drop(guard);
    result
}

fn resolve_class_locked(mu: &mut Mutator<'_>, name: &[u8]) -> VmResult<Ref> {
    let m = mu.m;
    let hash = hash_bytes(name);
    let map = m.class_table.lock().map;
    if let Some(class) = hash_map_find(m, map, hash, name) {
        return Ok(class);
    }

    let Some(data) = m.finder.find(name) else {
        let text = String::from_utf8_lossy(name).into_owned();
        return Err(mu.throw(ExcKind::ClassNotFound, Some(text)));
    };
    debug!(class = %String::from_utf8_lossy(name), "loading class");
    let Ok((_, cf)) = class::class_file(&data) else {
        let text = String::from_utf8_lossy(name).into_owned();
        return Err(mu.throw(ExcKind::ClassNotFound, Some(text)));
    };

    let depth = mu.protect_depth();
    let class = link_class(mu, &cf)?;
    let class_slot = mu.protect(class);
    let key = mu.make_bytes(name);
    mu.protect(key);
    let class = mu.protected(class_slot);
    hash_map_insert(mu, map, hash, key, class);
    mu.unprotect(depth);
    Ok(class)
}

fn malformed(mu: &mut Mutator<'_>) -> crate::runtime::thread::Thrown {
    mu.throw(ExcKind::ClassNotFound, Some("malformed class file".to_string()))
}

fn member_str(mu: &mut Mutator<'_>, cf: &ClassFile, index: u16) -> VmResult<String> {
    match cf.utf8(index) {
        Some(s) => Ok(s.to_string()),
        None => Err(malformed(mu)),
    }
}

/// Lowers a parsed class file into the object graph: superclass and
/// interfaces resolve eagerly (layout depends on them), pool entries stay
/// symbolic until first touch.
fn link_class(mu: &mut Mutator<'_>, cf: &ClassFile) -> VmResult<Ref> {
    let m = mu.m;
    let depth = mu.protect_depth();

    let this_name = match cf.class_name(cf.this_class) {
        Some(name) => name.to_string(),
        None => return Err(malformed(mu)),
    };

    let super_class = if cf.super_class == 0 {
        Ref::NULL
    } else {
        let super_name = match cf.class_name(cf.super_class) {
            Some(name) => name.to_string(),
            None => return Err(malformed(mu)),
        };
        resolve_class_locked(mu, super_name.as_bytes())?
    };
    let super_fixed = if super_class.is_null() {
        0
    } else {
        m.class_fixed_size(super_class)
    };

    let is_interface = cf.access_flags.contains(ClassAccessFlag::INTERFACE);
    let id = {
        let mut table = m.class_table.lock();
        if is_interface {
            let id = table.next_interface_id;
            table.next_interface_id += 1;
            id
        } else {
            let id = table.next_class_id;
            table.next_class_id += 1;
            id
        }
    };

    let name_ref = mu.make_bytes(this_name.as_bytes());
    mu.protect(name_ref);

    let class = mu.alloc(Cell::Class(Box::new(ClassCell {
        flags: cf.access_flags,
        id,
        name: name_ref,
        super_class,
        interface_table: Ref::NULL,
        method_table: Ref::NULL,
        field_table: Ref::NULL,
        static_table: Ref::NULL,
        initializers: Ref::NULL,
        fixed_size: super_fixed as u32,
    })));
    mu.protect(class);

    let mut interfaces = Vec::with_capacity(cf.interfaces.len());
    for &interface_index in &cf.interfaces {
        let interface_name = match cf.class_name(interface_index) {
            Some(name) => name.to_string(),
            None => return Err(malformed(mu)),
        };
        interfaces.push(resolve_class_locked(mu, interface_name.as_bytes())?);
    }

    let pool = link_pool(mu, cf)?;
    mu.protect(pool);

    link_fields(mu, cf, class, super_class, super_fixed)?;
    let clinit = link_methods(mu, cf, class, super_class, pool)?;
    link_interfaces(mu, class, super_class, &interfaces)?;

    if !clinit.is_null() {
        let chain = mu.alloc(Cell::Pair {
            first: clinit,
            second: Ref::NULL,
        });
        m.set_class_initializers(class, chain);
    }

    mu.unprotect(depth);
    Ok(class)
}

fn link_pool(mu: &mut Mutator<'_>, cf: &ClassFile) -> VmResult<Ref> {
    let m = mu.m;
    let pool = mu.alloc(Cell::RawArray(vec![Ref::NULL; cf.constant_pool.len()]));
    let depth = mu.protect_depth();
    mu.protect(pool);

    for (i, info) in cf.constant_pool.iter().enumerate() {
        let slot = match info {
            CpInfo::Utf8(s) => mu.make_bytes(s.as_bytes()),
            CpInfo::Integer(v) => mu.make_int(*v),
            CpInfo::Float(v) => mu.alloc(Cell::Float(*v)),
            CpInfo::Long(v) => mu.make_long(*v),
            CpInfo::Double(v) => mu.alloc(Cell::Double(*v)),
            CpInfo::Class { name_index } => {
                let name = member_str(mu, cf, *name_index)?;
                mu.make_bytes(name.as_bytes())
            }
            CpInfo::String { string_index } => {
                let text = member_str(mu, cf, *string_index)?;
                let scope = mu.protect_depth();
                let bytes = mu.make_bytes(text.as_bytes());
                let bytes_slot = mu.protect(bytes);
                let class = m.builtin(|b| b.string);
                let string = mu.alloc(Cell::Instance {
                    class,
                    fields: vec![mu.protected(bytes_slot)],
                });
                mu.unprotect(scope);
                string
            }
            CpInfo::Fieldref {
                class_index,
                name_and_type_index,
            }
            | CpInfo::Methodref {
                class_index,
                name_and_type_index,
            }
            | CpInfo::InterfaceMethodref {
                class_index,
                name_and_type_index,
            } => {
                let class_name = match cf.class_name(*class_index) {
                    Some(name) => name.to_string(),
                    None => return Err(malformed(mu)),
                };
                let Some(CpInfo::NameAndType {
                    name_index,
                    descriptor_index,
                }) = (*name_and_type_index)
                    .checked_sub(1)
                    .and_then(|i| cf.constant_pool.get(i as usize))
                else {
                    return Err(malformed(mu));
                };
                let member_name = member_str(mu, cf, *name_index)?;
                let member_spec = member_str(mu, cf, *descriptor_index)?;

                let scope = mu.protect_depth();
                let class_ref = mu.make_bytes(class_name.as_bytes());
                let class_slot = mu.protect(class_ref);
                let name_ref = mu.make_bytes(member_name.as_bytes());
                let name_slot = mu.protect(name_ref);
                let spec_ref = mu.make_bytes(member_spec.as_bytes());
                let spec_slot = mu.protect(spec_ref);
                let reference = mu.alloc(Cell::Reference {
                    class: mu.protected(class_slot),
                    name: mu.protected(name_slot),
                    spec: mu.protected(spec_slot),
                });
                mu.unprotect(scope);
                reference
            }
            CpInfo::NameAndType { .. } | CpInfo::Empty | CpInfo::Unsupported => Ref::NULL,
        };
        m.raw_set(pool, i, slot);
    }

    mu.unprotect(depth);
    Ok(pool)
}

fn link_fields(
    mu: &mut Mutator<'_>,
    cf: &ClassFile,
    class: Ref,
    super_class: Ref,
    super_fixed: usize,
) -> VmResult {
    let m = mu.m;
    let depth = mu.protect_depth();

    let mut field_refs = Vec::new();
    if !super_class.is_null() {
        let table = m.class_field_table(super_class);
        for i in 0..m.raw_len(table) {
            field_refs.push(m.raw_get(table, i));
        }
    }

    let mut instance_offset = super_fixed as u16;
    let mut static_offset: u16 = 0;
    for field in &cf.fields {
        let name = member_str(mu, cf, field.name_index)?;
        let spec = member_str(mu, cf, field.descriptor_index)?;

        let name_ref = mu.make_bytes(name.as_bytes());
        mu.protect(name_ref);
        let spec_ref = mu.make_bytes(spec.as_bytes());
        mu.protect(spec_ref);

        let is_static = field.access_flags.contains(FieldAccessFlag::STATIC);
        let offset = if is_static {
            let offset = static_offset;
            static_offset += 1;
            offset
        } else {
            let offset = instance_offset;
            instance_offset += 1;
            offset
        };

        let field_ref = mu.alloc(Cell::Field(Box::new(FieldCell {
            flags: field.access_flags,
            offset,
            class,
            name: name_ref,
            spec: spec_ref,
        })));
        mu.protect(field_ref);
        field_refs.push(field_ref);
    }

    let field_table = mu.alloc(Cell::RawArray(field_refs));
    mu.protect(field_table);
    let static_table = mu.alloc(Cell::RawArray(vec![Ref::NULL; static_offset as usize]));

    m.set_class_field_table(class, field_table);
    m.set_class_static_table(class, static_table);
    m.set_class_fixed_size(class, instance_offset as u32);

    mu.unprotect(depth);
    Ok(())
}

fn link_methods(
    mu: &mut Mutator<'_>,
    cf: &ClassFile,
    class: Ref,
    super_class: Ref,
    pool: Ref,
) -> VmResult<Ref> {
    let m = mu.m;
    let depth = mu.protect_depth();

    // the vtable starts as the superclass's; overrides replace in place so
    // offsets line up across the hierarchy
    let mut vtable = Vec::new();
    if !super_class.is_null() {
        let table = m.class_method_table(super_class);
        for i in 0..m.raw_len(table) {
            vtable.push(m.raw_get(table, i));
        }
    }

    let mut clinit = Ref::NULL;
    for method in &cf.methods {
        let name = member_str(mu, cf, method.name_index)?;
        let spec = member_str(mu, cf, method.descriptor_index)?;
        let Ok((_, descriptor)) = parse_method_descriptor(&spec) else {
            return Err(malformed(mu));
        };
        let is_static = method.access_flags.contains(MethodAccessFlag::STATIC);
        let parameter_count = descriptor.parameter_slots() + usize::from(!is_static);

        let mut code = Ref::NULL;
        for attribute in &method.attributes {
            if cf.utf8(attribute.attribute_name_index) == Some("Code") {
                let Ok((_, parsed)) = class::parse_code(&attribute.info) else {
                    return Err(malformed(mu));
                };
                let handlers = parsed
                    .exception_table
                    .iter()
                    .map(|e| HandlerEntry {
                        start_ip: e.start_pc,
                        end_ip: e.end_pc,
                        handler_ip: e.handler_pc,
                        catch_type: e.catch_type,
                    })
                    .collect();
                code = mu.alloc(Cell::Code(Box::new(CodeCell {
                    max_stack: parsed.max_stack,
                    max_locals: parsed.max_locals,
                    body: parsed.code,
                    pool,
                    handlers,
                })));
                break;
            }
        }
        if !code.is_null() {
            mu.protect(code);
        }

        let name_ref = mu.make_bytes(name.as_bytes());
        mu.protect(name_ref);
        let spec_ref = mu.make_bytes(spec.as_bytes());
        mu.protect(spec_ref);

        let mut offset = vtable.len();
        for (i, existing) in vtable.iter().enumerate() {
            if m.bytes_eq(m.method_name(*existing), name_ref)
                && m.bytes_eq(m.method_spec(*existing), spec_ref)
            {
                offset = i;
                break;
            }
        }

        let method_ref = mu.alloc(Cell::Method(Box::new(MethodCell {
            flags: method.access_flags,
            offset: offset as u16,
            parameter_count: parameter_count as u16,
            class,
            name: name_ref,
            spec: spec_ref,
            code,
        })));
        mu.protect(method_ref);

        if offset == vtable.len() {
            vtable.push(method_ref);
        } else {
            vtable[offset] = method_ref;
        }
        if name == "<clinit>" {
            clinit = method_ref;
        }
    }

    let method_table = mu.alloc(Cell::RawArray(vtable));
    m.set_class_method_table(class, method_table);

    mu.unprotect(depth);
    Ok(clinit)
}

fn link_interfaces(
    mu: &mut Mutator<'_>,
    class: Ref,
    super_class: Ref,
    declared: &[Ref],
) -> VmResult {
    let m = mu.m;
    let depth = mu.protect_depth();

    // inherited interfaces get fresh itables so overrides dispatch here
    let mut interfaces = Vec::new();
    if !super_class.is_null() {
        let table = m.class_interface_table(super_class);
        let len = m.raw_len(table);
        let mut i = 0;
        while i < len {
            interfaces.push(m.raw_get(table, i));
            i += 2;
        }
    }
    for &interface in declared {
        let id = m.class_id(interface);
        if !interfaces.iter().any(|&seen| m.class_id(seen) == id) {
            interfaces.push(interface);
        }
    }

    let vtable = m.class_method_table(class);
    let vtable_len = m.raw_len(vtable);
    let mut rows = Vec::with_capacity(interfaces.len() * 2);
    for interface in interfaces {
        let interface_methods = m.class_method_table(interface);
        let count = m.raw_len(interface_methods);
        let mut itable = vec![Ref::NULL; count];
        for (j, slot) in itable.iter_mut().enumerate() {
            let declared_method = m.raw_get(interface_methods, j);
            let name = m.method_name(declared_method);
            let spec = m.method_spec(declared_method);
            for k in 0..vtable_len {
                let candidate = m.raw_get(vtable, k);
                if m.bytes_eq(m.method_name(candidate), name)
                    && m.bytes_eq(m.method_spec(candidate), spec)
                {
                    *slot = candidate;
                    break;
                }
            }
        }
        let itable_ref = mu.alloc(Cell::RawArray(itable));
        mu.protect(itable_ref);
        rows.push(interface);
        rows.push(itable_ref);
    }

    let interface_table = mu.alloc(Cell::RawArray(rows));
    m.set_class_interface_table(class, interface_table);

    mu.unprotect(depth);
    Ok(())
}

pub(crate) enum MemberKind {
    Field,
    Method,
}

/// Resolves a class-name pool slot, rewriting it in place; resolved slots
/// return in one load.
pub(crate) fn resolve_pool_class(mu: &mut Mutator<'_>, pool: Ref, index: usize) -> VmResult<Ref> {
    let m = mu.m;
    let slot = m.raw_get(pool, index);
    let is_name = m.with_cell(slot, |cell| matches!(cell, Cell::ByteArray(_)));
    if !is_name {
        m.ensure(m.with_cell(slot, |cell| matches!(cell, Cell::Class(_))));
        return Ok(slot);
    }
    let name = m.bytes_vec(slot);
    let class = resolve_class(mu, &name)?;
    m.raw_set(pool, index, class);
    Ok(class)
}

/// Resolves the class embedded in a symbolic reference, rewriting the
/// container field.
fn resolve_reference_class(mu: &mut Mutator<'_>, reference: Ref) -> VmResult<Ref> {
    let m = mu.m;
    let (class_slot, _, _) = m.reference_parts(reference);
    let is_name = m.with_cell(class_slot, |cell| matches!(cell, Cell::ByteArray(_)));
    if !is_name {
        return Ok(class_slot);
    }
    let name = m.bytes_vec(class_slot);
    let class = resolve_class(mu, &name)?;
    m.set_reference_class(reference, class);
    Ok(class)
}

/// Resolves a member pool slot: resolve the declaring class, scan its
/// field or method table by (name, spec), rewrite the slot with the member.
pub(crate) fn resolve_pool_member(
    mu: &mut Mutator<'_>,
    pool: Ref,
    index: usize,
    kind: MemberKind,
) -> VmResult<Ref> {
    let m = mu.m;
    let slot = m.raw_get(pool, index);
    let resolved = m.with_cell(slot, |cell| match (&kind, cell) {
        (MemberKind::Field, Cell::Field(_)) => true,
        (MemberKind::Method, Cell::Method(_)) => true,
        (_, Cell::Reference { .. }) => false,
        _ => false,
    });
    if resolved {
        return Ok(slot);
    }
    m.ensure(m.with_cell(slot, |cell| matches!(cell, Cell::Reference { .. })));

    let class = resolve_reference_class(mu, slot)?;
    let (_, name, spec) = m.reference_parts(slot);
    let table = match kind {
        MemberKind::Field => m.class_field_table(class),
        MemberKind::Method => m.class_method_table(class),
    };

    let len = m.raw_len(table);
    for i in 0..len {
        let member = m.raw_get(table, i);
        let (member_name, member_spec) = match kind {
            MemberKind::Field => {
                let (_, n, s) = m.field_parts(member);
                (n, s)
            }
            MemberKind::Method => (m.method_name(member), m.method_spec(member)),
        };
        if m.bytes_eq(member_name, name) && m.bytes_eq(member_spec, spec) {
            m.raw_set(pool, index, member);
            return Ok(member);
        }
    }

    let message = format!(
        "{} ({}) not found in {}",
        m.bytes_string(name),
        m.bytes_string(spec),
        m.bytes_string(m.class_name(class))
    );
    let exc = match kind {
        MemberKind::Field => ExcKind::NoSuchField,
        MemberKind::Method => ExcKind::NoSuchMethod,
    };
    Err(mu.throw(exc, Some(message)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::machine::{ClassFinder, Machine, PanicSystem};
    use crate::runtime::thread::Thread;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingFinder {
        calls: AtomicUsize,
    }

    impl ClassFinder for CountingFinder {
        fn find(&self, _name: &[u8]) -> Option<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            None
        }
    }

    fn machine_with(finder: Arc<dyn ClassFinder>) -> Arc<Machine> {
        Machine::new(Arc::new(PanicSystem), Arc::new(crate::gc::MarkSweep), finder)
    }

    #[test]
    fn hash_matches_reference_scheme() {
        // h = h * 31 + byte
        assert_eq!(hash_bytes(b"A"), 65);
        assert_eq!(hash_bytes(b"AB"), 65 * 31 + 66);
    }

    #[test]
    fn builtin_classes_resolve_without_finder() {
        let finder = Arc::new(CountingFinder {
            calls: AtomicUsize::new(0),
        });
        let m = machine_with(finder.clone());
        let t = Thread::attach(&m, None);
        m.enter(&t, crate::runtime::coordinator::RunState::Active);

        let first = t.resolve_class(b"java/lang/Object").unwrap();
        let second = t.resolve_class(b"java/lang/Object").unwrap();
        assert_eq!(first, second);
        assert_eq!(finder.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn missing_class_raises_class_not_found() {
        let finder = Arc::new(CountingFinder {
            calls: AtomicUsize::new(0),
        });
        let m = machine_with(finder.clone());
        let t = Thread::attach(&m, None);
        m.enter(&t, crate::runtime::coordinator::RunState::Active);

        assert!(t.resolve_class(b"does/not/Exist").is_none());
        let exception = t.pending_exception();
        assert!(!exception.is_null());
        assert_eq!(
            m.class_name_of(exception).unwrap(),
            "java/lang/ClassNotFoundException"
        );
        assert_eq!(m.exception_message(exception).unwrap(), "does/not/Exist");
        assert_eq!(finder.calls.load(Ordering::SeqCst), 1);

        // a second miss consults the finder again; misses are not cached
        t.clear_exception();
        assert!(t.resolve_class(b"does/not/Exist").is_none());
        assert_eq!(finder.calls.load(Ordering::SeqCst), 2);
    }
}
