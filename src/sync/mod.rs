pub mod wait_queue;

pub use wait_queue::WaitQueue;
