//! Background tasks

mod maintenance;

pub use maintenance::MaintenanceTask;
