pub mod append_log;

pub use append_log::AppendLog;
