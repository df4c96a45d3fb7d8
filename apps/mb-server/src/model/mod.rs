pub mod record;
pub mod task;

pub use record::{Metadata, Record};
pub use task::UploadTask;
