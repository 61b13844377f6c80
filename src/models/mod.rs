mod tasks;

pub use tasks::*;
