use std::io;
use std::path::Path;

const DEVICE_ID_FILE: &str = "device_id";

/// Returns this device's stable identifier, generating and persisting one
/// on first use.
pub fn device_id(base_dir: &Path) -> io::Result<String> {
    let path = base_dir.join(DEVICE_ID_FILE);
    match std::fs::read_to_string(&path) {
        Ok(id) if !id.trim().is_empty() => Ok(id.trim().to_string()),
        _ => {
            let id = uuid::Uuid::new_v4().to_string();
            std::fs::write(&path, &id)?;
            Ok(id)
        }
    }
}
