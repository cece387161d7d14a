mod visitor;

pub use visitor::{Error, TaskError, Visitor};
