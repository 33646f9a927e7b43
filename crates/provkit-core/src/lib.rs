mod operand;
mod progress;
mod status;
mod unit;

pub use operand::{Operand, UnitChange};
pub use progress::{NullProgress, PauseGate, ProgressMonitor, SubProgress};
pub use status::{Severity, Status};
pub use unit::Unit;
