pub mod futex;

pub use futex::{Futex, FutexTable};
