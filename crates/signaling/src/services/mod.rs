pub mod call_service;
pub mod room_monitor;
pub mod room_provider;
