pub mod history;
pub mod output;

pub use history::InputHistory;
pub use output::{LineKind, OutputLine, OutputLog};
