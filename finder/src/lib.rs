//! USB discovery and reset backend for fleet devices.
//!
//! A device in application firmware exposes one CDC serial port per
//! processor; a processor in the bootloader exposes a UF2 mass-storage
//! volume instead. Discovery therefore merges two views: the serial port
//! enumeration (matched by USB vendor/product id) and the platform mount
//! table (matched by the marker file on each volume). Reset is the UF2
//! "touch" convention: open the port at 1200 baud and close it again.

mod info;
mod mounts;

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

use fleet::{Device, DeviceScanner, ExposureKind, ProcessorHandle, ProcessorRole, ScanError};
use log::{debug, warn};
use nonempty::NonEmpty;
use serialport::{SerialPortType, available_ports};

pub use info::{VolumeMarker, parse_marker};

/// USB identity of the fleet hardware.
#[derive(Debug, Clone)]
pub struct FinderConfig {
    pub vendor_id: u16,
    pub main_product_id: u16,
    pub display_product_id: u16,
}

impl Default for FinderConfig {
    fn default() -> Self {
        // The shipped firmware enumerates under the Raspberry Pi vendor id
        // with one product id per processor.
        FinderConfig {
            vendor_id: 0x2e8a,
            main_product_id: 0x000a,
            display_product_id: 0x100a,
        }
    }
}

impl FinderConfig {
    fn role_for_product(&self, pid: u16) -> Option<ProcessorRole> {
        if pid == self.main_product_id {
            Some(ProcessorRole::Main)
        } else if pid == self.display_product_id {
            Some(ProcessorRole::Display)
        } else {
            None
        }
    }
}

/// The production [DeviceScanner].
#[derive(Debug, Default)]
pub struct UsbFinder {
    config: FinderConfig,
}

impl UsbFinder {
    pub fn new(config: FinderConfig) -> Self {
        UsbFinder { config }
    }

    /// Serial-mode processors, as `(serial, role, port name)`.
    fn serial_ports(&self) -> Result<Vec<(String, ProcessorRole, String)>, ScanError> {
        let ports = available_ports().map_err(|err| ScanError(err.to_string()))?;
        let mut found = Vec::new();
        for port in ports {
            // Only accept /dev/cu.* on macOS so each port shows up once,
            // not as both its tty and cu device node.
            if cfg!(target_os = "macos") && !port.port_name.contains("/cu.") {
                continue;
            }
            let SerialPortType::UsbPort(usb) = port.port_type else {
                continue;
            };
            if usb.vid != self.config.vendor_id {
                continue;
            }
            let Some(role) = self.config.role_for_product(usb.pid) else {
                continue;
            };
            let Some(serial) = usb.serial_number else {
                debug!("{}: fleet port without a serial number, skipped", port.port_name);
                continue;
            };
            found.push((serial, role, port.port_name));
        }
        Ok(found)
    }

    /// Bootloader volumes, as `(serial, role, mount path)`.
    fn bootloader_volumes(&self) -> Result<Vec<(String, ProcessorRole, PathBuf)>, ScanError> {
        let mut found = Vec::new();
        for volume in mounts::candidate_volumes()? {
            let marker_path = volume.join(info::INFO_FILE_NAME);
            let Ok(contents) = std::fs::read_to_string(&marker_path) else {
                continue;
            };
            match info::parse_marker(&contents) {
                Some(marker) => found.push((marker.serial, marker.role, volume)),
                None => debug!("{}: not a fleet bootloader volume", volume.display()),
            }
        }
        Ok(found)
    }

    fn port_for(&self, serial: &str, role: ProcessorRole) -> Result<String, ScanError> {
        self.serial_ports()?
            .into_iter()
            .find(|(s, r, _)| s == serial && *r == role)
            .map(|(_, _, port)| port)
            .ok_or_else(|| ScanError(format!("no {role} serial port for device {serial}")))
    }
}

impl DeviceScanner for UsbFinder {
    fn discover_all(&self) -> Result<Vec<Device>, ScanError> {
        let mut builders: BTreeMap<String, Builder> = BTreeMap::new();
        for (serial, role, port) in self.serial_ports()? {
            builders.entry(serial).or_default().add_port(role, port);
        }
        for (serial, role, mount) in self.bootloader_volumes()? {
            builders.entry(serial).or_default().add_mount(role, mount);
        }
        Ok(builders
            .into_iter()
            .map(|(serial, builder)| builder.build(serial))
            .collect())
    }

    fn reset_to_bootloader(&self, serial: &str, role: ProcessorRole) -> Result<(), ScanError> {
        let port_name = self.port_for(serial, role)?;
        debug!("{serial} {role}: touching {port_name} at 1200 baud");
        match serialport::new(&port_name, 1200)
            .timeout(Duration::from_secs(1))
            .open()
        {
            // Dropping the port completes the touch reset.
            Ok(_port) => Ok(()),
            Err(err) => match err.kind {
                // The port going away mid-open means the device is already
                // rebooting into the bootloader.
                serialport::ErrorKind::NoDevice => Ok(()),
                serialport::ErrorKind::Io(ErrorKind::BrokenPipe | ErrorKind::NotFound) => Ok(()),
                _ => {
                    warn!("{serial} {role}: touch reset on {port_name} failed: {err}");
                    Err(ScanError(err.to_string()))
                }
            },
        }
    }
}

/// Accumulates the per-role sightings of one serial number.
#[derive(Default)]
struct Builder {
    main: RoleSighting,
    display: RoleSighting,
}

#[derive(Default)]
struct RoleSighting {
    port: Option<String>,
    mounts: Vec<PathBuf>,
}

impl Builder {
    fn slot(&mut self, role: ProcessorRole) -> &mut RoleSighting {
        match role {
            ProcessorRole::Main => &mut self.main,
            ProcessorRole::Display => &mut self.display,
        }
    }

    fn add_port(&mut self, role: ProcessorRole, port: String) {
        self.slot(role).port = Some(port);
    }

    fn add_mount(&mut self, role: ProcessorRole, mount: PathBuf) {
        self.slot(role).mounts.push(mount);
    }

    fn build(self, serial: String) -> Device {
        Device {
            serial,
            main: self.main.into_handle(ProcessorRole::Main),
            display: self.display.into_handle(ProcessorRole::Display),
        }
    }
}

impl RoleSighting {
    fn into_handle(self, role: ProcessorRole) -> Option<ProcessorHandle> {
        let mounts = NonEmpty::from_vec(self.mounts);
        // A volume can linger in the mount table across the mode change;
        // when both sides are visible the mass-storage view wins, the copy
        // path needs the mount and the reset path re-queries anyway.
        let kind = match (&mounts, &self.port) {
            (Some(_), _) => ExposureKind::MassStorage,
            (None, Some(_)) => ExposureKind::Serial,
            (None, None) => return None,
        };
        Some(ProcessorHandle {
            role,
            kind,
            port: self.port,
            mounts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_maps_product_ids_to_roles() {
        let config = FinderConfig::default();
        assert_eq!(config.role_for_product(0x000a), Some(ProcessorRole::Main));
        assert_eq!(
            config.role_for_product(0x100a),
            Some(ProcessorRole::Display)
        );
        assert_eq!(config.role_for_product(0x0003), None);
    }

    #[test]
    fn builder_prefers_mass_storage_when_both_sides_are_visible() {
        let mut builder = Builder::default();
        builder.add_port(ProcessorRole::Main, "/dev/ttyACM0".into());
        builder.add_mount(ProcessorRole::Main, PathBuf::from("/media/MAINBOOT"));
        let device = builder.build("FW0001".into());

        let handle = device.handle(ProcessorRole::Main).unwrap();
        assert_eq!(handle.kind, ExposureKind::MassStorage);
        assert_eq!(
            device.mount(ProcessorRole::Main),
            Some(&PathBuf::from("/media/MAINBOOT"))
        );
        assert!(device.handle(ProcessorRole::Display).is_none());
    }

    #[test]
    fn device_with_no_sightings_has_no_handles() {
        let builder = Builder::default();
        let device = builder.build("FW0001".into());
        assert!(device.main.is_none());
        assert!(device.display.is_none());
    }
}
