pub mod ids;
pub mod priority;
pub mod options;
pub mod record;
pub mod events;

pub use ids::{JobId, WorkerId};
pub use priority::JobPriority;
pub use options::JobOptions;
pub use record::{JobCounts, JobRecord, JobStatus};
pub use events::JobEvent;
