pub mod event;
pub mod exposure;
pub mod measurement;
pub mod narrative;
pub mod subject;
