use std::sync::Arc;

use cloudpaste_core::DriverError;
use cloudpaste_driver_api::{Capability, CapabilitySet, DriverKind, StorageDriver};

use crate::local::LocalDriver;
use crate::s3::S3Driver;
use crate::webdav::WebdavDriver;

/// Capabilities each driver kind can legitimately declare.
pub fn supported_capabilities(kind: DriverKind) -> CapabilitySet {
    match kind {
        DriverKind::S3 => CapabilitySet::of(&[
            Capability::Reader,
            Capability::Writer,
            Capability::DirectLink,
            Capability::Multipart,
            Capability::Atomic,
        ]),
        DriverKind::Webdav => CapabilitySet::of(&[
            Capability::Reader,
            Capability::Writer,
            Capability::Proxy,
            Capability::Atomic,
        ]),
        DriverKind::Local => CapabilitySet::of(&[
            Capability::Reader,
            Capability::Writer,
            Capability::Proxy,
            Capability::Atomic,
        ]),
    }
}

/// A driver may not claim capabilities its kind cannot back.
pub fn validate_driver_contract(driver: &dyn StorageDriver) -> Result<(), DriverError> {
    let declared = driver.capabilities();
    let supported = supported_capabilities(driver.kind());
    if !declared.is_subset_of(supported) {
        return Err(DriverError::new(
            "INVALID_DRIVER_CONTRACT",
            format!(
                "driver kind {} declares unsupported capabilities: declared {declared}, supported {supported}",
                driver.kind().as_str()
            ),
        ));
    }
    Ok(())
}

/// Materialize a driver from a storage-config blob. Secret fields must
/// already be decrypted by the caller.
pub fn build_driver(
    kind: DriverKind,
    config: &serde_json::Value,
) -> Result<Arc<dyn StorageDriver>, DriverError> {
    let driver: Arc<dyn StorageDriver> = match kind {
        DriverKind::Local => Arc::new(LocalDriver::from_config(config)?),
        DriverKind::Webdav => Arc::new(WebdavDriver::from_config(config)?),
        DriverKind::S3 => Arc::new(S3Driver::from_config(config)?),
    };
    validate_driver_contract(driver.as_ref())?;
    Ok(driver)
}
