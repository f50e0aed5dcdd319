use tracing::trace;

use crate::consts::{
    ClassAccessFlag, T_BOOLEAN, T_BYTE, T_CHAR, T_DOUBLE, T_FLOAT, T_INT, T_LONG, T_SHORT,
};
use crate::runtime::coordinator::RunState;
use crate::runtime::loader::{self, MemberKind};
use crate::runtime::machine::ExcKind;
use crate::runtime::opcodes as op;
use crate::runtime::store::{Cell, FrameCell, Ref};
use crate::runtime::thread::{Mutator, Thread, Thrown, VmResult};

/// Runs the thread's current frame to completion: a value or void return
/// from the entry frame, or an uncaught exception with no default handler.
/// The thread must be Active.
pub fn run(thread: &Thread) -> Ref {
    let machine = thread.machine();
    machine.ensure(thread.state() == RunState::Active);
    let mut interp = Interp {
        mu: Mutator::new(machine, thread.shared.as_ref()),
    };
    interp.execute()
}

/// Pushes an entry frame for `method` (arguments already on the operand
/// stack) and runs it to completion.
pub fn invoke(thread: &Thread, method: Ref) -> Ref {
    let machine = thread.machine();
    machine.ensure(thread.state() == RunState::Active);
    let parameter_count = machine.method_parameter_count(method);
    let mut interp = Interp {
        mu: Mutator::new(machine, thread.shared.as_ref()),
    };
    match interp.invoke_method(method, parameter_count) {
        Ok(()) => interp.execute(),
        Err(Thrown) => match interp.unwind() {
            Some(value) => value,
            None => interp.execute(),
        },
    }
}

enum Step {
    Next,
    Finished(Ref),
}

struct Interp<'m> {
    mu: Mutator<'m>,
}

impl<'m> Interp<'m> {
    fn execute(&mut self) -> Ref {
        loop {
            match self.step() {
                Ok(Step::Next) => {}
                Ok(Step::Finished(value)) => return value,
                Err(Thrown) => {
                    if let Some(value) = self.unwind() {
                        return value;
                    }
                }
            }
        }
    }

    // decode helpers

    fn fetch(&mut self) -> u8 {
        let m = self.mu.m;
        let (code, ip) = {
            let roots = self.mu.roots();
            (roots.code, roots.ip)
        };
        let byte = m.code_byte(code, ip);
        self.mu.roots().ip = ip + 1;
        byte
    }

    fn operand_u8(&mut self) -> u8 {
        self.fetch()
    }

    fn operand_u16(&mut self) -> u16 {
        let hi = self.fetch() as u16;
        let lo = self.fetch() as u16;
        (hi << 8) | lo
    }

    fn operand_i32(&mut self) -> i32 {
        let mut value = 0u32;
        for _ in 0..4 {
            value = (value << 8) | self.fetch() as u32;
        }
        value as i32
    }

    /// Converts a one-based constant pool index.
    fn pool_at(&self, index: u16) -> usize {
        self.mu.m.ensure(index > 0);
        index as usize - 1
    }

    fn current_pool(&mut self) -> Ref {
        let code = self.mu.roots().code;
        self.mu.m.code_pool(code)
    }

    /// Branch targets are relative to the opcode address.
    fn jump(&mut self, insn_ip: usize, offset: i32) {
        self.mu.roots().ip = (insn_ip as i64 + offset as i64) as usize;
    }

    // value helpers

    fn pop_int(&mut self) -> i32 {
        let value = self.mu.pop();
        self.mu.m.int_value(value)
    }

    fn pop_long(&mut self) -> i64 {
        let value = self.mu.pop();
        self.mu.m.long_value(value)
    }

    fn push_int(&mut self, value: i32) {
        let boxed = self.mu.make_int(value);
        self.mu.push(boxed);
    }

    fn push_long(&mut self, value: i64) {
        let boxed = self.mu.make_long(value);
        self.mu.push(boxed);
    }

    fn int_binop(&mut self, f: impl FnOnce(i32, i32) -> i32) {
        let b = self.pop_int();
        let a = self.pop_int();
        self.push_int(f(a, b));
    }

    fn long_binop(&mut self, f: impl FnOnce(i64, i64) -> i64) {
        let b = self.pop_long();
        let a = self.pop_long();
        self.push_long(f(a, b));
    }

    /// Long shifts take an int count, masked to the operand width.
    fn long_shift(&mut self, f: impl FnOnce(i64, u32) -> i64) {
        let count = self.pop_int();
        let a = self.pop_long();
        self.push_long(f(a, count as u32 & 63));
    }

    fn npe(&mut self) -> Thrown {
        self.mu.throw(ExcKind::NullPointer, None)
    }

    fn divide_by_zero(&mut self) -> Thrown {
        self.mu
            .throw(ExcKind::Arithmetic, Some("/ by zero".to_string()))
    }

    fn bounds(&mut self, index: i32, length: usize) -> VmResult {
        if index >= 0 && (index as usize) < length {
            Ok(())
        } else {
            let message = format!("{} not in [0,{}]", index, length);
            Err(self.mu.throw(ExcKind::ArrayIndexOutOfBounds, Some(message)))
        }
    }

    fn load_local(&mut self, index: usize) {
        let frame = self.mu.roots().frame;
        let value = self.mu.m.frame_local(frame, index);
        self.mu.push(value);
    }

    fn store_local(&mut self, index: usize) {
        let value = self.mu.pop();
        let frame = self.mu.roots().frame;
        self.mu.m.set_frame_local(frame, index, value);
    }

    fn increment_local(&mut self, index: usize, delta: i32) {
        let m = self.mu.m;
        let frame = self.mu.roots().frame;
        let value = m.int_value(m.frame_local(frame, index));
        let boxed = self.mu.make_int(value.wrapping_add(delta));
        let frame = self.mu.roots().frame;
        m.set_frame_local(frame, index, boxed);
    }

    // dispatch

    fn step(&mut self) -> VmResult<Step> {
        let insn_ip = self.mu.roots().ip;
        let opcode = self.fetch();
        let m = self.mu.m;

        match opcode {
            op::NOP => {}

            // constants
            op::ACONST_NULL => self.mu.push(Ref::NULL),
            op::ICONST_M1
            | op::ICONST_0
            | op::ICONST_1
            | op::ICONST_2
            | op::ICONST_3
            | op::ICONST_4
            | op::ICONST_5 => {
                self.push_int(opcode as i32 - op::ICONST_0 as i32);
            }
            op::LCONST_0 => self.push_long(0),
            op::LCONST_1 => self.push_long(1),
            op::BIPUSH => {
                let value = self.operand_u8() as i8 as i32;
                self.push_int(value);
            }
            op::SIPUSH => {
                let value = self.operand_u16() as i16 as i32;
                self.push_int(value);
            }
            op::LDC => {
                let index = self.operand_u8() as u16;
                self.load_constant(index)?;
            }
            op::LDC_W | op::LDC2_W => {
                let index = self.operand_u16();
                self.load_constant(index)?;
            }

            // local loads and stores
            op::ALOAD | op::ILOAD | op::LLOAD => {
                let index = self.operand_u8() as usize;
                self.load_local(index);
            }
            op::ALOAD_0 | op::ILOAD_0 | op::LLOAD_0 => self.load_local(0),
            op::ALOAD_1 | op::ILOAD_1 | op::LLOAD_1 => self.load_local(1),
            op::ALOAD_2 | op::ILOAD_2 | op::LLOAD_2 => self.load_local(2),
            op::ALOAD_3 | op::ILOAD_3 | op::LLOAD_3 => self.load_local(3),
            op::ASTORE | op::ISTORE | op::LSTORE => {
                let index = self.operand_u8() as usize;
                self.store_local(index);
            }
            op::ASTORE_0 | op::ISTORE_0 | op::LSTORE_0 => self.store_local(0),
            op::ASTORE_1 | op::ISTORE_1 | op::LSTORE_1 => self.store_local(1),
            op::ASTORE_2 | op::ISTORE_2 | op::LSTORE_2 => self.store_local(2),
            op::ASTORE_3 | op::ISTORE_3 | op::LSTORE_3 => self.store_local(3),

            // arrays
            op::IALOAD | op::LALOAD | op::AALOAD | op::BALOAD | op::CALOAD | op::SALOAD => {
                self.array_load(opcode)?;
            }
            op::IASTORE | op::LASTORE | op::AASTORE | op::BASTORE | op::CASTORE | op::SASTORE => {
                self.array_store(opcode)?;
            }
            op::ARRAYLENGTH => {
                let array = self.mu.pop();
                if array.is_null() {
                    return Err(self.npe());
                }
                let length = m.array_length(array);
                self.push_int(length as i32);
            }
            op::NEWARRAY => {
                let tag = self.operand_u8();
                let count = self.pop_int();
                if count < 0 {
                    let message = format!("{}", count);
                    return Err(self.mu.throw(ExcKind::NegativeArraySize, Some(message)));
                }
                let n = count as usize;
                let cell = match tag {
                    T_BOOLEAN => Cell::BooleanArray(vec![0; n]),
                    T_CHAR => Cell::CharArray(vec![0; n]),
                    T_FLOAT => Cell::FloatArray(vec![0.0; n]),
                    T_DOUBLE => Cell::DoubleArray(vec![0.0; n]),
                    T_BYTE => Cell::ByteArray(vec![0; n]),
                    T_SHORT => Cell::ShortArray(vec![0; n]),
                    T_INT => Cell::IntArray(vec![0; n]),
                    T_LONG => Cell::LongArray(vec![0; n]),
                    _ => m.fatal("unknown primitive array tag"),
                };
                let array = self.mu.alloc(cell);
                self.mu.push(array);
            }
            op::ANEWARRAY => {
                let count = self.pop_int();
                let index = self.operand_u16();
                if count < 0 {
                    let message = format!("{}", count);
                    return Err(self.mu.throw(ExcKind::NegativeArraySize, Some(message)));
                }
                let pool = self.current_pool();
                let slot = self.pool_at(index);
                let class = loader::resolve_pool_class(&mut self.mu, pool, slot)?;
                let depth = self.mu.protect_depth();
                self.mu.protect(class);
                let body = vec![Ref::NULL; count as usize];
                let array = self.mu.alloc(Cell::ObjectArray { class, body });
                self.mu.unprotect(depth);
                self.mu.push(array);
            }

            // operand stack
            op::POP => {
                self.mu.pop();
            }
            op::POP2 => {
                let top = self.mu.pop();
                if !m.is_long_or_double(top) {
                    self.mu.pop();
                }
            }
            op::DUP => {
                let top = self.mu.peek(0);
                self.mu.push(top);
            }
            op::DUP_X1 => {
                let first = self.mu.pop();
                let second = self.mu.pop();
                self.mu.push(first);
                self.mu.push(second);
                self.mu.push(first);
            }
            op::DUP_X2 => {
                let first = self.mu.pop();
                let second = self.mu.pop();
                let third = self.mu.pop();
                self.mu.push(first);
                self.mu.push(third);
                self.mu.push(second);
                self.mu.push(first);
            }
            op::DUP2 => {
                let first = self.mu.peek(0);
                if m.is_long_or_double(first) {
                    self.mu.push(first);
                } else {
                    let second = self.mu.peek(1);
                    self.mu.push(second);
                    self.mu.push(first);
                }
            }
            op::DUP2_X1 => {
                let first = self.mu.pop();
                let second = self.mu.pop();
                if m.is_long_or_double(first) {
                    self.mu.push(first);
                    self.mu.push(second);
                    self.mu.push(first);
                } else {
                    let third = self.mu.pop();
                    self.mu.push(second);
                    self.mu.push(first);
                    self.mu.push(third);
                    self.mu.push(second);
                    self.mu.push(first);
                }
            }
            op::DUP2_X2 => {
                let first = self.mu.pop();
                let second = self.mu.pop();
                if m.is_long_or_double(first) {
                    if m.is_long_or_double(second) {
                        self.mu.push(first);
                        self.mu.push(second);
                        self.mu.push(first);
                    } else {
                        let third = self.mu.pop();
                        self.mu.push(first);
                        self.mu.push(third);
                        self.mu.push(second);
                        self.mu.push(first);
                    }
                } else {
                    let third = self.mu.pop();
                    if m.is_long_or_double(third) {
                        self.mu.push(second);
                        self.mu.push(first);
                        self.mu.push(third);
                        self.mu.push(second);
                        self.mu.push(first);
                    } else {
                        let fourth = self.mu.pop();
                        self.mu.push(second);
                        self.mu.push(first);
                        self.mu.push(fourth);
                        self.mu.push(third);
                        self.mu.push(second);
                        self.mu.push(first);
                    }
                }
            }
            op::SWAP => {
                let first = self.mu.peek(0);
                let second = self.mu.peek(1);
                self.mu.set_top(0, second);
                self.mu.set_top(1, first);
            }

            // integer arithmetic; overflow wraps modulo 2^32
            op::IADD => self.int_binop(i32::wrapping_add),
            op::ISUB => self.int_binop(i32::wrapping_sub),
            op::IMUL => self.int_binop(i32::wrapping_mul),
            op::IDIV => {
                let b = self.pop_int();
                let a = self.pop_int();
                if b == 0 {
                    return Err(self.divide_by_zero());
                }
                self.push_int(a.wrapping_div(b));
            }
            op::IREM => {
                let b = self.pop_int();
                let a = self.pop_int();
                if b == 0 {
                    return Err(self.divide_by_zero());
                }
                self.push_int(a.wrapping_rem(b));
            }
            op::INEG => {
                let v = self.pop_int();
                self.push_int(v.wrapping_neg());
            }
            op::ISHL => self.int_binop(|a, b| a.wrapping_shl(b as u32)),
            op::ISHR => self.int_binop(|a, b| a.wrapping_shr(b as u32)),
            op::IUSHR => self.int_binop(|a, b| ((a as u32).wrapping_shr(b as u32)) as i32),
            op::IAND => self.int_binop(|a, b| a & b),
            op::IOR => self.int_binop(|a, b| a | b),
            op::IXOR => self.int_binop(|a, b| a ^ b),
            op::IINC => {
                let index = self.operand_u8() as usize;
                let delta = self.operand_u8() as i8 as i32;
                self.increment_local(index, delta);
            }

            // long arithmetic
            op::LADD => self.long_binop(i64::wrapping_add),
            op::LSUB => self.long_binop(i64::wrapping_sub),
            op::LMUL => self.long_binop(i64::wrapping_mul),
            op::LDIV => {
                let b = self.pop_long();
                let a = self.pop_long();
                if b == 0 {
                    return Err(self.divide_by_zero());
                }
                self.push_long(a.wrapping_div(b));
            }
            op::LREM => {
                let b = self.pop_long();
                let a = self.pop_long();
                if b == 0 {
                    return Err(self.divide_by_zero());
                }
                self.push_long(a.wrapping_rem(b));
            }
            op::LNEG => {
                let v = self.pop_long();
                self.push_long(v.wrapping_neg());
            }
            op::LSHL => self.long_shift(|a, c| a.wrapping_shl(c)),
            op::LSHR => self.long_shift(|a, c| a.wrapping_shr(c)),
            op::LUSHR => self.long_shift(|a, c| ((a as u64) >> c) as i64),
            op::LAND => self.long_binop(|a, b| a & b),
            op::LOR => self.long_binop(|a, b| a | b),
            op::LXOR => self.long_binop(|a, b| a ^ b),
            op::LCMP => {
                let b = self.pop_long();
                let a = self.pop_long();
                self.push_int(match a.cmp(&b) {
                    std::cmp::Ordering::Greater => 1,
                    std::cmp::Ordering::Equal => 0,
                    std::cmp::Ordering::Less => -1,
                });
            }

            // conversions
            op::I2L => {
                let v = self.pop_int();
                self.push_long(v as i64);
            }
            op::L2I => {
                let v = self.pop_long();
                self.push_int(v as i32);
            }
            op::I2B => {
                let v = self.pop_int();
                self.push_int(v as i8 as i32);
            }
            op::I2C => {
                let v = self.pop_int();
                self.push_int(v as u16 as i32);
            }
            op::I2S => {
                let v = self.pop_int();
                self.push_int(v as i16 as i32);
            }

            // control flow
            op::GOTO => {
                let offset = self.operand_u16() as i16 as i32;
                self.jump(insn_ip, offset);
            }
            op::GOTO_W => {
                let offset = self.operand_i32();
                self.jump(insn_ip, offset);
            }
            op::JSR => {
                let offset = self.operand_u16() as i16 as i32;
                let return_ip = self.mu.roots().ip;
                self.push_int(return_ip as i32);
                self.jump(insn_ip, offset);
            }
            op::JSR_W => {
                let offset = self.operand_i32();
                let return_ip = self.mu.roots().ip;
                self.push_int(return_ip as i32);
                self.jump(insn_ip, offset);
            }
            op::RET => {
                let index = self.operand_u8() as usize;
                let frame = self.mu.roots().frame;
                let target = m.int_value(m.frame_local(frame, index));
                self.mu.roots().ip = target as usize;
            }
            op::IFEQ | op::IFNE | op::IFLT | op::IFGE | op::IFGT | op::IFLE => {
                let offset = self.operand_u16() as i16 as i32;
                let v = self.pop_int();
                let taken = match opcode {
                    op::IFEQ => v == 0,
                    op::IFNE => v != 0,
                    op::IFLT => v < 0,
                    op::IFGE => v >= 0,
                    op::IFGT => v > 0,
                    _ => v <= 0,
                };
                if taken {
                    self.jump(insn_ip, offset);
                }
            }
            op::IF_ICMPEQ
            | op::IF_ICMPNE
            | op::IF_ICMPLT
            | op::IF_ICMPGE
            | op::IF_ICMPGT
            | op::IF_ICMPLE => {
                let offset = self.operand_u16() as i16 as i32;
                let b = self.pop_int();
                let a = self.pop_int();
                let taken = match opcode {
                    op::IF_ICMPEQ => a == b,
                    op::IF_ICMPNE => a != b,
                    op::IF_ICMPLT => a < b,
                    op::IF_ICMPGE => a >= b,
                    op::IF_ICMPGT => a > b,
                    _ => a <= b,
                };
                if taken {
                    self.jump(insn_ip, offset);
                }
            }
            op::IF_ACMPEQ | op::IF_ACMPNE => {
                let offset = self.operand_u16() as i16 as i32;
                let b = self.mu.pop();
                let a = self.mu.pop();
                let taken = if opcode == op::IF_ACMPEQ { a == b } else { a != b };
                if taken {
                    self.jump(insn_ip, offset);
                }
            }
            op::IFNULL | op::IFNONNULL => {
                let offset = self.operand_u16() as i16 as i32;
                let v = self.mu.pop();
                let taken = if opcode == op::IFNULL {
                    v.is_null()
                } else {
                    !v.is_null()
                };
                if taken {
                    self.jump(insn_ip, offset);
                }
            }

            // objects and fields
            op::NEW => {
                let index = self.operand_u16();
                let pool = self.current_pool();
                let slot = self.pool_at(index);
                let class = loader::resolve_pool_class(&mut self.mu, pool, slot)?;
                if self.run_initializer(class)? {
                    return Ok(Step::Next);
                }
                let size = m.class_fixed_size(class);
                let depth = self.mu.protect_depth();
                self.mu.protect(class);
                let instance = self.mu.alloc(Cell::Instance {
                    class,
                    fields: vec![Ref::NULL; size],
                });
                self.mu.unprotect(depth);
                self.mu.push(instance);
            }
            op::GETFIELD => {
                let index = self.operand_u16();
                let pool = self.current_pool();
                let slot = self.pool_at(index);
                let field =
                    loader::resolve_pool_member(&mut self.mu, pool, slot, MemberKind::Field)?;
                let instance = self.mu.pop();
                if instance.is_null() {
                    return Err(self.npe());
                }
                let value = m.instance_field(instance, m.field_offset(field));
                self.mu.push(value);
            }
            op::PUTFIELD => {
                let index = self.operand_u16();
                let pool = self.current_pool();
                let slot = self.pool_at(index);
                let field =
                    loader::resolve_pool_member(&mut self.mu, pool, slot, MemberKind::Field)?;
                let value = self.mu.pop();
                let instance = self.mu.pop();
                if instance.is_null() {
                    return Err(self.npe());
                }
                m.set_instance_field(instance, m.field_offset(field), value);
            }
            op::GETSTATIC => {
                let index = self.operand_u16();
                let pool = self.current_pool();
                let slot = self.pool_at(index);
                let field =
                    loader::resolve_pool_member(&mut self.mu, pool, slot, MemberKind::Field)?;
                let class = m.field_class(field);
                if self.run_initializer(class)? {
                    return Ok(Step::Next);
                }
                let statics = m.class_static_table(class);
                let value = m.raw_get(statics, m.field_offset(field));
                self.mu.push(value);
            }
            op::PUTSTATIC => {
                let index = self.operand_u16();
                let pool = self.current_pool();
                let slot = self.pool_at(index);
                let field =
                    loader::resolve_pool_member(&mut self.mu, pool, slot, MemberKind::Field)?;
                let class = m.field_class(field);
                if self.run_initializer(class)? {
                    return Ok(Step::Next);
                }
                let value = self.mu.pop();
                let statics = m.class_static_table(class);
                m.raw_set(statics, m.field_offset(field), value);
            }
            op::CHECKCAST => {
                let index = self.operand_u16();
                if !self.mu.peek(0).is_null() {
                    let pool = self.current_pool();
                    let slot = self.pool_at(index);
                    let class = loader::resolve_pool_class(&mut self.mu, pool, slot)?;
                    let object = self.mu.peek(0);
                    if !m.instance_of(class, object) {
                        let message = format!(
                            "{} as {}",
                            m.bytes_string(m.class_name(m.class_of(object))),
                            m.bytes_string(m.class_name(class))
                        );
                        return Err(self.mu.throw(ExcKind::ClassCast, Some(message)));
                    }
                }
            }
            op::INSTANCEOF => {
                let index = self.operand_u16();
                if self.mu.peek(0).is_null() {
                    self.mu.pop();
                    self.push_int(0);
                } else {
                    let pool = self.current_pool();
                    let slot = self.pool_at(index);
                    let class = loader::resolve_pool_class(&mut self.mu, pool, slot)?;
                    let object = self.mu.pop();
                    self.push_int(m.instance_of(class, object) as i32);
                }
            }

            // invocation
            op::INVOKESTATIC => {
                let index = self.operand_u16();
                let pool = self.current_pool();
                let slot = self.pool_at(index);
                let method =
                    loader::resolve_pool_member(&mut self.mu, pool, slot, MemberKind::Method)?;
                let class = m.method_class(method);
                if self.run_initializer(class)? {
                    return Ok(Step::Next);
                }
                let parameter_count = m.method_parameter_count(method);
                self.invoke_method(method, parameter_count)?;
            }
            op::INVOKESPECIAL => {
                let index = self.operand_u16();
                let pool = self.current_pool();
                let slot = self.pool_at(index);
                let method =
                    loader::resolve_pool_member(&mut self.mu, pool, slot, MemberKind::Method)?;
                let parameter_count = m.method_parameter_count(method);
                let receiver = self.mu.peek(parameter_count - 1);
                if receiver.is_null() {
                    return Err(self.npe());
                }
                let frame = self.mu.roots().frame;
                let current_class = m.method_class(m.frame_method(frame));
                let target = if self.is_special(method, current_class) {
                    let super_table = m.class_method_table(m.class_super(current_class));
                    m.raw_get(super_table, m.method_offset(method))
                } else {
                    method
                };
                self.invoke_method(target, parameter_count)?;
            }
            op::INVOKEVIRTUAL => {
                let index = self.operand_u16();
                let pool = self.current_pool();
                let slot = self.pool_at(index);
                let method =
                    loader::resolve_pool_member(&mut self.mu, pool, slot, MemberKind::Method)?;
                let parameter_count = m.method_parameter_count(method);
                let receiver = self.mu.peek(parameter_count - 1);
                if receiver.is_null() {
                    return Err(self.npe());
                }
                let table = m.class_method_table(m.class_of(receiver));
                let target = m.raw_get(table, m.method_offset(method));
                self.invoke_method(target, parameter_count)?;
            }
            op::INVOKEINTERFACE => {
                let index = self.operand_u16();
                // count and zero bytes, kept for format compatibility
                let _ = self.operand_u8();
                let _ = self.operand_u8();
                let pool = self.current_pool();
                let slot = self.pool_at(index);
                let method =
                    loader::resolve_pool_member(&mut self.mu, pool, slot, MemberKind::Method)?;
                let parameter_count = m.method_parameter_count(method);
                let receiver = self.mu.peek(parameter_count - 1);
                if receiver.is_null() {
                    return Err(self.npe());
                }
                let target = self.find_interface_method(method, receiver)?;
                self.invoke_method(target, parameter_count)?;
            }

            // returns
            op::IRETURN | op::LRETURN | op::ARETURN => {
                let frame = self.mu.roots().frame;
                let next = m.frame_next(frame);
                if next.is_null() {
                    let value = self.mu.pop();
                    let roots = self.mu.roots();
                    roots.frame = Ref::NULL;
                    roots.code = Ref::NULL;
                    return Ok(Step::Finished(value));
                }
                let code = m.method_code(m.frame_method(next));
                let ip = m.frame_ip(next);
                let roots = self.mu.roots();
                roots.frame = next;
                roots.code = code;
                roots.ip = ip;
            }
            op::RETURN => {
                let frame = self.mu.roots().frame;
                let next = m.frame_next(frame);
                if next.is_null() {
                    let roots = self.mu.roots();
                    roots.frame = Ref::NULL;
                    roots.code = Ref::NULL;
                    return Ok(Step::Finished(Ref::NULL));
                }
                let code = m.method_code(m.frame_method(next));
                let ip = m.frame_ip(next);
                let roots = self.mu.roots();
                roots.frame = next;
                roots.code = code;
                roots.ip = ip;
            }

            op::ATHROW => {
                let thrown = self.mu.pop();
                let thrown = if thrown.is_null() {
                    self.mu.make_exception(ExcKind::NullPointer, None)
                } else {
                    thrown
                };
                self.mu.roots().exception = thrown;
                return Err(Thrown);
            }

            op::WIDE => {
                let wide_op = self.fetch();
                match wide_op {
                    op::ALOAD | op::ILOAD | op::LLOAD => {
                        let index = self.operand_u16() as usize;
                        self.load_local(index);
                    }
                    op::ASTORE | op::ISTORE | op::LSTORE => {
                        let index = self.operand_u16() as usize;
                        self.store_local(index);
                    }
                    op::IINC => {
                        let index = self.operand_u16() as usize;
                        let delta = self.operand_u16() as i16 as i32;
                        self.increment_local(index, delta);
                    }
                    op::RET => {
                        let index = self.operand_u16() as usize;
                        let frame = self.mu.roots().frame;
                        let target = m.int_value(m.frame_local(frame, index));
                        self.mu.roots().ip = target as usize;
                    }
                    _ => m.fatal("unknown wide opcode"),
                }
            }

            _ => m.fatal("unknown opcode"),
        }

        Ok(Step::Next)
    }

    /// `ldc` family: ints, floats, longs, doubles and strings were
    /// materialized at link time; class entries resolve on first touch.
    fn load_constant(&mut self, index: u16) -> VmResult {
        let m = self.mu.m;
        let pool = self.current_pool();
        let slot = self.pool_at(index);
        let entry = m.raw_get(pool, slot);
        let is_name = m.with_cell(entry, |cell| matches!(cell, Cell::ByteArray(_)));
        let value = if is_name {
            loader::resolve_pool_class(&mut self.mu, pool, slot)?
        } else {
            entry
        };
        self.mu.push(value);
        Ok(())
    }

    fn array_load(&mut self, opcode: u8) -> VmResult {
        let m = self.mu.m;
        let index = self.pop_int();
        let array = self.mu.pop();
        if array.is_null() {
            return Err(self.npe());
        }
        let length = m.array_length(array);
        self.bounds(index, length)?;
        let i = index as usize;

        enum Loaded {
            I(i32),
            L(i64),
            R(Ref),
        }
        let loaded = m.with_cell(array, |cell| match (opcode, cell) {
            (op::IALOAD, Cell::IntArray(b)) => Loaded::I(b[i]),
            (op::LALOAD, Cell::LongArray(b)) => Loaded::L(b[i]),
            (op::AALOAD, Cell::ObjectArray { body, .. }) => Loaded::R(body[i]),
            (op::BALOAD, Cell::ByteArray(b)) => Loaded::I(b[i] as i32),
            (op::BALOAD, Cell::BooleanArray(b)) => Loaded::I(b[i] as i32),
            (op::CALOAD, Cell::CharArray(b)) => Loaded::I(b[i] as i32),
            (op::SALOAD, Cell::ShortArray(b)) => Loaded::I(b[i] as i32),
            _ => m.fatal("array type mismatch"),
        });
        match loaded {
            Loaded::I(v) => self.push_int(v),
            Loaded::L(v) => self.push_long(v),
            Loaded::R(v) => self.mu.push(v),
        }
        Ok(())
    }

    fn array_store(&mut self, opcode: u8) -> VmResult {
        let m = self.mu.m;
        let value = self.mu.pop();
        let index = self.pop_int();
        let array = self.mu.pop();
        if array.is_null() {
            return Err(self.npe());
        }
        let length = m.array_length(array);
        self.bounds(index, length)?;
        let i = index as usize;

        if opcode == op::AASTORE {
            {
                let mut store = m.store.write();
                match store.get_mut(array) {
                    Cell::ObjectArray { body, .. } => body[i] = value,
                    _ => m.fatal("array type mismatch"),
                }
            }
            m.heap.check(array, value);
            return Ok(());
        }

        let long_value = if opcode == op::LASTORE {
            m.long_value(value)
        } else {
            0
        };
        let int_value = if opcode == op::LASTORE {
            0
        } else {
            m.int_value(value)
        };
        let mut store = m.store.write();
        match (opcode, store.get_mut(array)) {
            (op::IASTORE, Cell::IntArray(b)) => b[i] = int_value,
            (op::LASTORE, Cell::LongArray(b)) => b[i] = long_value,
            (op::BASTORE, Cell::ByteArray(b)) => b[i] = int_value as i8,
            (op::BASTORE, Cell::BooleanArray(b)) => b[i] = (int_value & 1) as u8,
            (op::CASTORE, Cell::CharArray(b)) => b[i] = int_value as u16,
            (op::SASTORE, Cell::ShortArray(b)) => b[i] = int_value as i16,
            _ => m.fatal("array type mismatch"),
        }
        Ok(())
    }

    /// Drains one initializer from the class's chain: rewinds the ip so
    /// the triggering opcode re-executes after the initializer returns,
    /// then invokes it through the ordinary frame path.
    fn run_initializer(&mut self, class: Ref) -> VmResult<bool> {
        let m = self.mu.m;
        let chain = m.class_initializers(class);
        if chain.is_null() {
            return Ok(false);
        }
        let (head, rest) = m.pair_parts(chain);
        m.set_class_initializers(class, rest);
        self.mu.roots().ip -= 3;
        trace!("running class initializer");
        self.invoke_method(head, 0)?;
        Ok(true)
    }

    /// ACC_SUPER semantics: a non-constructor call to a strict superclass
    /// method dispatches through the superclass's table at the same offset.
    fn is_special(&mut self, method: Ref, current_class: Ref) -> bool {
        let m = self.mu.m;
        if !m.class_flags(current_class).contains(ClassAccessFlag::SUPER) {
            return false;
        }
        if m.bytes_eq_slice(m.method_name(method), b"<init>") {
            return false;
        }
        m.is_superclass(m.method_class(method), current_class)
    }

    /// Linear scan of the receiver class's interface table; inherited
    /// interfaces were flattened into it at link time, so no superclass
    /// walk happens here.
    fn find_interface_method(&mut self, method: Ref, receiver: Ref) -> VmResult<Ref> {
        let m = self.mu.m;
        let id = m.class_id(m.method_class(method));
        let offset = m.method_offset(method);
        let itable = m.class_interface_table(m.class_of(receiver));
        let len = m.raw_len(itable);
        let mut i = 0;
        while i < len {
            if m.class_id(m.raw_get(itable, i)) == id {
                let table = m.raw_get(itable, i + 1);
                let target = m.raw_get(table, offset);
                if target.is_null() {
                    let message = format!(
                        "{} ({}) not found in {}",
                        m.bytes_string(m.method_name(method)),
                        m.bytes_string(m.method_spec(method)),
                        m.bytes_string(m.class_name(m.class_of(receiver)))
                    );
                    return Err(self.mu.throw(ExcKind::NoSuchMethod, Some(message)));
                }
                return Ok(target);
            }
            i += 2;
        }
        m.fatal("receiver does not implement interface")
    }

    /// The shared frame-setup path: stack headroom check, caller ip save,
    /// argument transfer into locals, register reload.
    fn invoke_method(&mut self, method: Ref, parameter_count: usize) -> VmResult {
        let m = self.mu.m;
        let new_code = m.method_code(method);
        if new_code.is_null() {
            let message = format!(
                "{} ({}) not found in {}",
                m.bytes_string(m.method_name(method)),
                m.bytes_string(m.method_spec(method)),
                m.bytes_string(m.class_name(m.method_class(method)))
            );
            return Err(self.mu.throw(ExcKind::NoSuchMethod, Some(message)));
        }

        let (frame, sp, ip, stack_len) = {
            let roots = self.mu.roots();
            (roots.frame, roots.sp, roots.ip, roots.stack.len())
        };
        m.ensure(sp >= parameter_count);
        if m.code_max_stack(new_code) + sp - parameter_count > stack_len {
            return Err(self.mu.throw(ExcKind::StackOverflow, None));
        }

        if !frame.is_null() {
            m.set_frame_ip(frame, ip);
        }

        let max_locals = m.code_max_locals(new_code).max(parameter_count);
        let mut locals = vec![Ref::NULL; max_locals];
        {
            let roots = self.mu.roots();
            locals[..parameter_count].copy_from_slice(&roots.stack[sp - parameter_count..sp]);
        }

        // arguments stay on the stack (still roots) until the frame exists
        let new_frame = self.mu.alloc(Cell::Frame(Box::new(FrameCell {
            method,
            next: frame,
            ip: 0,
            stack_base: (sp - parameter_count) as u32,
            locals,
        })));

        let roots = self.mu.roots();
        roots.sp = sp - parameter_count;
        roots.frame = new_frame;
        roots.code = new_code;
        roots.ip = 0;
        Ok(())
    }

    /// Walks frames outward looking for a handler whose catch type is the
    /// catch-all or a supertype of the pending exception. With no catch,
    /// control passes to the thread's default handler; with no default
    /// handler, returns null leaving the exception installed.
    fn unwind(&mut self) -> Option<Ref> {
        let m = self.mu.m;
        let exception = self.mu.roots().exception;
        m.ensure(!exception.is_null());
        trace!("unwinding");

        let mut frame = self.mu.roots().frame;
        while !frame.is_null() {
            let code = m.method_code(m.frame_method(frame));
            self.mu.roots().code = code;
            for handler in m.code_handlers(code) {
                let matched = if handler.catch_type == 0 {
                    true
                } else {
                    let pool = m.code_pool(code);
                    match loader::resolve_pool_class(
                        &mut self.mu,
                        pool,
                        handler.catch_type as usize - 1,
                    ) {
                        Ok(catch_class) => m.instance_of(catch_class, exception),
                        Err(Thrown) => {
                            // unresolvable catch type: skip the row, keep
                            // the original exception
                            self.mu.roots().exception = exception;
                            false
                        }
                    }
                };
                if matched {
                    let base = m.frame_stack_base(frame);
                    let roots = self.mu.roots();
                    roots.frame = frame;
                    roots.sp = base;
                    roots.ip = handler.handler_ip as usize;
                    self.mu.push(exception);
                    self.mu.roots().exception = Ref::NULL;
                    return None;
                }
            }
            frame = m.frame_next(frame);
        }

        let thread_obj = self.mu.roots().thread_obj;
        let handler = if thread_obj.is_null() {
            Ref::NULL
        } else {
            m.with_cell(thread_obj, |cell| match cell {
                Cell::ThreadObject { handler } => *handler,
                _ => Ref::NULL,
            })
        };
        if handler.is_null() {
            let roots = self.mu.roots();
            roots.frame = Ref::NULL;
            roots.code = Ref::NULL;
            return Some(Ref::NULL);
        }

        let code = m.method_code(handler);
        let max_locals = m.code_max_locals(code);
        let new_frame = self.mu.alloc(Cell::Frame(Box::new(FrameCell {
            method: handler,
            next: Ref::NULL,
            ip: 0,
            stack_base: 0,
            locals: vec![Ref::NULL; max_locals],
        })));
        let roots = self.mu.roots();
        roots.frame = new_frame;
        roots.code = code;
        roots.sp = 0;
        roots.ip = 0;
        self.mu.push(exception);
        self.mu.roots().exception = Ref::NULL;
        None
    }
}
