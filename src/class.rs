mod parser;
mod structs;

pub use parser::{class_file, parse_code};
pub use structs::*;
