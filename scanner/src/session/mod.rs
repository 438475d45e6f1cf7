pub mod export;
pub mod history;
pub mod store;

pub use export::{parse_text_line, render, write_export, ExportError};
pub use history::{HistoryDb, HistoryError};
pub use store::{Classification, SessionStore};
