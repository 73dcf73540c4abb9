// Formula parsing, reference rewriting and evaluation

pub mod adjust;
pub mod eval;
pub mod functions;
pub mod parser;
pub mod refs;
pub mod value;
