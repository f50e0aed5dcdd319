use nom::{
    branch::alt,
    bytes::complete::take_until,
    character::complete::{char, one_of},
    combinator::{eof, map},
    multi::many0,
    sequence::delimited,
    IResult, Parser,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldDescriptor(pub(crate) FieldType);

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct MethodDescriptor {
    pub(crate) parameters: Vec<FieldType>,
    pub(crate) return_type: ReturnType,
}

pub type ReturnType = Option<FieldType>;

#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub enum FieldType {
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    Object(String),
    Short,
    Boolean,
    Array(Box<FieldType>),
}

impl MethodDescriptor {
    /// Operand slots consumed by a call, receiver excluded. Every value is
    /// boxed and occupies one slot, longs and doubles included.
    pub fn parameter_slots(&self) -> usize {
        self.parameters.len()
    }
}

pub fn parse_field_descriptor(input: &str) -> IResult<&str, FieldDescriptor> {
    let (input, field_type) = parse_field_type(input)?;
    eof(input)?;
    Ok((input, FieldDescriptor(field_type)))
}

pub fn parse_method_descriptor(input: &str) -> IResult<&str, MethodDescriptor> {
    let (input, parameters) =
        delimited(char('('), many0(parse_field_type), char(')')).parse(input)?;

    let (input, return_type) = parse_return_type_descriptor(input)?;

    eof(input)?;
    Ok((
        input,
        MethodDescriptor {
            parameters,
            return_type,
        },
    ))
}

pub fn parse_return_type_descriptor(input: &str) -> IResult<&str, ReturnType> {
    alt((map(parse_field_type, Some), parse_void_type)).parse(input)
}

fn parse_field_type(input: &str) -> IResult<&str, FieldType> {
    alt((parse_base_type, parse_object_type, parse_array_type)).parse(input)
}

fn parse_base_type(input: &str) -> IResult<&str, FieldType> {
    let (input, ch) = one_of("BCDFIJSZ")(input)?;
    let field_type = match ch {
        'B' => FieldType::Byte,
        'C' => FieldType::Char,
        'D' => FieldType::Double,
        'F' => FieldType::Float,
        'I' => FieldType::Int,
        'J' => FieldType::Long,
        'S' => FieldType::Short,
        'Z' => FieldType::Boolean,
        _ => unreachable!("one_of limits the alphabet"),
    };
    Ok((input, field_type))
}

fn parse_object_type(input: &str) -> IResult<&str, FieldType> {
    let (input, _) = char('L')(input)?;
    let (input, class_name) = take_until(";")(input)?;
    let (input, _) = char(';')(input)?;

    Ok((input, FieldType::Object(class_name.to_string())))
}

fn parse_array_type(input: &str) -> IResult<&str, FieldType> {
    let (input, _) = char('[')(input)?;
    let (input, field_type) = parse_field_type(input)?;

    Ok((input, FieldType::Array(Box::new(field_type))))
}

fn parse_void_type(input: &str) -> IResult<&str, Option<FieldType>> {
    let (input, _) = char('V')(input)?;
    Ok((input, None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_primitive_field() {
        let (_, d) = parse_field_descriptor("I").unwrap();
        assert_eq!(d.0, FieldType::Int);
    }

    #[test]
    fn parses_object_and_array() {
        let (_, d) = parse_field_descriptor("[Ljava/lang/Object;").unwrap();
        assert_eq!(
            d.0,
            FieldType::Array(Box::new(FieldType::Object("java/lang/Object".into())))
        );
    }

    #[test]
    fn parses_method_descriptor() {
        let (_, d) = parse_method_descriptor("(IJ[B)V").unwrap();
        assert_eq!(d.parameters.len(), 3);
        assert_eq!(d.return_type, None);
        assert_eq!(d.parameter_slots(), 3);
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(parse_method_descriptor("(I)Vx").is_err());
    }
}
