//! Host-side simulation harness: wires the security layer and update manager
//! to in-memory collaborators and runs one secure/verify exchange.

use fieldgate::platform::MockPlatform;
use fieldgate::security::NonceSecurityLayer;
use fieldgate::store::MemoryRecordStore;
use fieldgate::transport::ScriptedCloud;
use fieldgate::update::FirmwareUpdateManager;
use fieldgate::{SecurityConfig, UpdateConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = SecurityConfig {
        psk: "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef".into(),
        ..SecurityConfig::default()
    };
    let mut security = NonceSecurityLayer::new(config, MemoryRecordStore::new(), || 0);
    security.begin()?;

    let envelope = security.secure_message(r#"{"status":"online"}"#)?;
    println!("secured envelope: {}", security.generate_envelope(&envelope));
    println!("security stats: {}", security.stats());

    let mut updater = FirmwareUpdateManager::new(
        UpdateConfig::default(),
        MemoryRecordStore::new(),
        MockPlatform::new("1.0.0"),
        ScriptedCloud::new(),
    );
    updater.report_boot_status();
    updater.begin()?;
    println!("fota state: {}", updater.state().name());

    Ok(())
}
