//! Everything that reads the products of finished grid jobs: framework output
//! files, job log archives and the sums of event weights derived from them.

pub mod inspect;
pub mod logs;
pub mod process;
pub mod weights;

pub use inspect::{ExecInspector, FileSummary, InspectError, OutputInspector};
pub use weights::{sum_dicts, WeightSums, WeightsError};
