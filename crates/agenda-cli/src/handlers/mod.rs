pub mod breakpoint;
pub mod executor;
pub mod history;
pub mod job;
pub mod lock;
pub mod process;
