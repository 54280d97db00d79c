use fleet::ProcessorRole;

/// Marker file every UF2 bootloader volume carries at its root.
pub const INFO_FILE_NAME: &str = "INFO_UF2.TXT";

/// Identity parsed out of an `INFO_UF2.TXT` marker file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMarker {
    pub serial: String,
    pub role: ProcessorRole,
}

/// Parse the bootloader's marker file.
///
/// The shipped bootloaders append the processor role to the `Board-ID`
/// line and carry the device serial on a `Serial` line:
///
/// ```text
/// UF2 Bootloader v3.0
/// Model: Raspberry Pi RP2
/// Board-ID: FW-RP2-Main
/// Serial: FW0001
/// ```
///
/// Volumes from other UF2 boards (a Pico plugged in next to the fleet is
/// common on a lab bench) fail to parse and are skipped.
pub fn parse_marker(contents: &str) -> Option<VolumeMarker> {
    let mut serial = None;
    let mut role = None;
    for line in contents.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Serial" => serial = Some(value.to_string()),
            "Board-ID" => {
                role = if value.ends_with("-Main") {
                    Some(ProcessorRole::Main)
                } else if value.ends_with("-Display") {
                    Some(ProcessorRole::Display)
                } else {
                    return None;
                };
            }
            _ => {}
        }
    }
    Some(VolumeMarker {
        serial: serial?,
        role: role?,
    })
}
