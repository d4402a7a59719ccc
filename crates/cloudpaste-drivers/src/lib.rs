pub mod factory;
pub mod local;
pub mod s3;
pub mod webdav;
pub mod webdav_client;

pub use factory::{build_driver, supported_capabilities, validate_driver_contract};
