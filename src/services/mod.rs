// Services used by the lifecycle core
pub mod file_system_service;
pub mod memory_service;
pub mod process_service;
