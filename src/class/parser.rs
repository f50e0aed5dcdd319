use nom::{
    bytes::complete::{tag, take},
    combinator::eof,
    error_position,
    multi::count,
    number::complete::{be_f32, be_f64, be_i32, be_i64, be_u16, be_u32, u8},
    IResult,
};

use crate::{
    class::{
        AttributeInfo, ClassFile, CodeAttribute, CpInfo, ExceptionTableEntry, FieldInfo, MethodInfo,
    },
    consts::{ClassAccessFlag, FieldAccessFlag, MethodAccessFlag},
};

pub fn class_file(input: &[u8]) -> IResult<&[u8], ClassFile> {
    let (input, (minor, major)) = parse_header(input)?;
    let (input, constant_pool) = parse_constant_pool(input)?;

    let (input, access_flags) = be_u16(input)?;
    let (input, this_class) = be_u16(input)?;
    let (input, super_class) = be_u16(input)?;
    let (input, interfaces) = parse_interfaces(input)?;
    let (input, fields) = parse_fields(input)?;
    let (input, methods) = parse_methods(input)?;
    let (input, attributes) = parse_attributes(input)?;

    eof(input)?;

    Ok((
        input,
        ClassFile {
            major_version: major,
            minor_version: minor,
            // extra bits allowed
            access_flags: ClassAccessFlag::from_bits_retain(access_flags),
            this_class,
            super_class,
            constant_pool,
            interfaces,
            fields,
            methods,
            attributes,
        },
    ))
}

/// Parses the body of a `Code` attribute. Nested attributes (line numbers,
/// local variable tables) are skipped.
pub fn parse_code(input: &[u8]) -> IResult<&[u8], CodeAttribute> {
    let (input, max_stack) = be_u16(input)?;
    let (input, max_locals) = be_u16(input)?;

    let (input, code_length) = be_u32(input)?;
    let (input, code) = take(code_length)(input)?;

    let (input, exception_table_length) = be_u16(input)?;
    let (input, exception_table) =
        count(parse_exception_entry, exception_table_length as _)(input)?;

    let (input, _) = parse_attributes(input)?;

    Ok((
        input,
        CodeAttribute {
            max_stack,
            max_locals,
            code: code.to_vec(),
            exception_table,
        },
    ))
}

fn parse_exception_entry(input: &[u8]) -> IResult<&[u8], ExceptionTableEntry> {
    let (input, start_pc) = be_u16(input)?;
    let (input, end_pc) = be_u16(input)?;
    let (input, handler_pc) = be_u16(input)?;
    let (input, catch_type) = be_u16(input)?;

    Ok((
        input,
        ExceptionTableEntry {
            start_pc,
            end_pc,
            handler_pc,
            catch_type,
        },
    ))
}

fn parse_header(input: &[u8]) -> IResult<&[u8], (u16, u16)> {
    let (input, _) = tag(&[0xca, 0xfe, 0xba, 0xbe])(input)?;
    let (input, minor) = be_u16(input)?;
    let (input, major) = be_u16(input)?;
    Ok((input, (minor, major)))
}

fn parse_constant_pool(input: &[u8]) -> IResult<&[u8], Vec<CpInfo>> {
    let (input, constant_pool_count) = be_u16(input)?;

    let mut constant_pool = Vec::with_capacity(constant_pool_count.max(1) as usize - 1);

    let mut input = input;

    while constant_pool.len() + 1 < constant_pool_count as usize {
        let constant;
        (input, constant) = parse_constant(input)?;
        let need_empty = matches!(constant, CpInfo::Long(_) | CpInfo::Double(_));
        constant_pool.push(constant);
        if need_empty {
            constant_pool.push(CpInfo::Empty);
        }
    }

    Ok((input, constant_pool))
}

fn parse_constant(mut input: &[u8]) -> IResult<&[u8], CpInfo> {
    let tag;
    (input, tag) = u8(input)?;
    let cp_info = match tag {
        1 => {
            let length;
            (input, length) = be_u16(input)?;
            let bytes;
            (input, bytes) = take(length)(input)?;
            let Ok(decoded) = cesu8::from_java_cesu8(bytes) else {
                return Err(nom::Err::Error(error_position!(
                    input,
                    nom::error::ErrorKind::Verify
                )));
            };
            CpInfo::Utf8(decoded.into_owned())
        }
        3 => {
            let int;
            (input, int) = be_i32(input)?;
            CpInfo::Integer(int)
        }
        4 => {
            let float;
            (input, float) = be_f32(input)?;
            CpInfo::Float(float)
        }
        5 => {
            let long;
            (input, long) = be_i64(input)?;
            CpInfo::Long(long)
        }
        6 => {
            let double;
            (input, double) = be_f64(input)?;
            CpInfo::Double(double)
        }
        7 => {
            let name_index;
            (input, name_index) = be_u16(input)?;
            CpInfo::Class { name_index }
        }
        8 => {
            let string_index;
            (input, string_index) = be_u16(input)?;
            CpInfo::String { string_index }
        }
        9 => {
            let (class_index, name_and_type_index);
            (input, class_index) = be_u16(input)?;
            (input, name_and_type_index) = be_u16(input)?;
            CpInfo::Fieldref {
                class_index,
                name_and_type_index,
            }
        }
        10 => {
            let (class_index, name_and_type_index);
            (input, class_index) = be_u16(input)?;
            (input, name_and_type_index) = be_u16(input)?;
            CpInfo::Methodref {
                class_index,
                name_and_type_index,
            }
        }
        11 => {
            let (class_index, name_and_type_index);
            (input, class_index) = be_u16(input)?;
            (input, name_and_type_index) = be_u16(input)?;
            CpInfo::InterfaceMethodref {
                class_index,
                name_and_type_index,
            }
        }
        12 => {
            let (name_index, descriptor_index);
            (input, name_index) = be_u16(input)?;
            (input, descriptor_index) = be_u16(input)?;
            CpInfo::NameAndType {
                name_index,
                descriptor_index,
            }
        }
        // method handles and dynamic call sites are carried but never used
        15 => {
            (input, _) = take(3usize)(input)?;
            CpInfo::Unsupported
        }
        16 | 19 | 20 => {
            (input, _) = take(2usize)(input)?;
            CpInfo::Unsupported
        }
        17 | 18 => {
            (input, _) = take(4usize)(input)?;
            CpInfo::Unsupported
        }
        _ => {
            return Err(nom::Err::Error(error_position!(
                input,
                nom::error::ErrorKind::Tag
            )));
        }
    };
    Ok((input, cp_info))
}

fn parse_interfaces(input: &[u8]) -> IResult<&[u8], Vec<u16>> {
    let (input, interface_count) = be_u16(input)?;
    let (input, interfaces) = count(be_u16, interface_count as _)(input)?;
    Ok((input, interfaces))
}

fn parse_fields(input: &[u8]) -> IResult<&[u8], Vec<FieldInfo>> {
    let (input, field_count) = be_u16(input)?;
    let (input, fields) = count(parse_field, field_count as _)(input)?;
    Ok((input, fields))
}

fn parse_field(input: &[u8]) -> IResult<&[u8], FieldInfo> {
    let (input, access_flags) = be_u16(input)?;
    let (input, name_index) = be_u16(input)?;
    let (input, descriptor_index) = be_u16(input)?;
    let (input, attributes) = parse_attributes(input)?;

    Ok((
        input,
        FieldInfo {
            access_flags: FieldAccessFlag::from_bits_retain(access_flags),
            name_index,
            descriptor_index,
            attributes,
        },
    ))
}

fn parse_attributes(input: &[u8]) -> IResult<&[u8], Vec<AttributeInfo>> {
    let (input, attributes_count) = be_u16(input)?;
    let (input, attributes) = count(parse_attribute, attributes_count as _)(input)?;
    Ok((input, attributes))
}

fn parse_attribute(input: &[u8]) -> IResult<&[u8], AttributeInfo> {
    let (input, attribute_name_index) = be_u16(input)?;
    let (input, attribute_length) = be_u32(input)?;
    let (input, info) = take(attribute_length)(input)?;

    Ok((
        input,
        AttributeInfo {
            attribute_name_index,
            info: info.to_vec(),
        },
    ))
}

fn parse_methods(input: &[u8]) -> IResult<&[u8], Vec<MethodInfo>> {
    let (input, methods_count) = be_u16(input)?;
    let (input, methods) = count(parse_method, methods_count as _)(input)?;
    Ok((input, methods))
}

fn parse_method(input: &[u8]) -> IResult<&[u8], MethodInfo> {
    let (input, access_flags) = be_u16(input)?;
    let (input, name_index) = be_u16(input)?;
    let (input, descriptor_index) = be_u16(input)?;
    let (input, attributes) = parse_attributes(input)?;

    Ok((
        input,
        MethodInfo {
            access_flags: MethodAccessFlag::from_bits_retain(access_flags),
            name_index,
            descriptor_index,
            attributes,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_class() -> Vec<u8> {
        let mut b: Vec<u8> = vec![0xca, 0xfe, 0xba, 0xbe, 0, 0, 0, 52];
        // constant pool: Utf8 "A", Class #1, Utf8 "java/lang/Object", Class #3
        b.extend_from_slice(&5u16.to_be_bytes());
        b.push(1);
        b.extend_from_slice(&1u16.to_be_bytes());
        b.push(b'A');
        b.push(7);
        b.extend_from_slice(&1u16.to_be_bytes());
        b.push(1);
        b.extend_from_slice(&16u16.to_be_bytes());
        b.extend_from_slice(b"java/lang/Object");
        b.push(7);
        b.extend_from_slice(&3u16.to_be_bytes());
        // flags, this, super, interfaces, fields, methods, attributes
        b.extend_from_slice(&0x0021u16.to_be_bytes());
        b.extend_from_slice(&2u16.to_be_bytes());
        b.extend_from_slice(&4u16.to_be_bytes());
        b.extend_from_slice(&0u16.to_be_bytes());
        b.extend_from_slice(&0u16.to_be_bytes());
        b.extend_from_slice(&0u16.to_be_bytes());
        b.extend_from_slice(&0u16.to_be_bytes());
        b
    }

    #[test]
    fn parses_minimal_class() {
        let bytes = minimal_class();
        let (_, cf) = class_file(&bytes).unwrap();
        assert_eq!(cf.class_name(cf.this_class), Some("A"));
        assert_eq!(cf.class_name(cf.super_class), Some("java/lang/Object"));
        assert!(cf.access_flags.contains(ClassAccessFlag::SUPER));
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = [0u8; 16];
        assert!(class_file(&bytes).is_err());
    }

    #[test]
    fn long_constants_take_two_slots() {
        let mut b: Vec<u8> = vec![0xca, 0xfe, 0xba, 0xbe, 0, 0, 0, 52];
        b.extend_from_slice(&5u16.to_be_bytes());
        b.push(5);
        b.extend_from_slice(&7i64.to_be_bytes());
        b.push(1);
        b.extend_from_slice(&1u16.to_be_bytes());
        b.push(b'A');
        b.push(7);
        b.extend_from_slice(&3u16.to_be_bytes());
        b.extend_from_slice(&0x0021u16.to_be_bytes());
        b.extend_from_slice(&4u16.to_be_bytes());
        b.extend_from_slice(&0u16.to_be_bytes());
        for _ in 0..4 {
            b.extend_from_slice(&0u16.to_be_bytes());
        }
        let (_, cf) = class_file(&b).unwrap();
        assert!(matches!(cf.constant_pool[0], CpInfo::Long(7)));
        assert!(matches!(cf.constant_pool[1], CpInfo::Empty));
    }
}
