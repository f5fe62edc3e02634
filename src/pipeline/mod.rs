pub mod annotator;
pub mod parser;
