use fleet::{Device, DeviceScanner, ExposureKind, ProcessorRole};

use crate::CliError;

pub(crate) fn list_devices(scanner: &dyn DeviceScanner) -> Result<(), CliError> {
    let devices = scanner.discover_all()?;
    if devices.is_empty() {
        println!("No devices found");
    } else {
        for device in &devices {
            print_device(device);
        }
    }
    Ok(())
}

fn print_device(device: &Device) {
    println!("{}", device.serial);
    for role in [ProcessorRole::Main, ProcessorRole::Display] {
        match device.handle(role) {
            Some(handle) => {
                let location = match handle.kind {
                    ExposureKind::Serial => handle.port.clone().unwrap_or_default(),
                    ExposureKind::MassStorage => handle
                        .mounts
                        .as_ref()
                        .map(|mounts| mounts.first().display().to_string())
                        .unwrap_or_default(),
                    ExposureKind::Unknown => String::new(),
                };
                println!("  {:8} {:12} {}", role, kind_name(handle.kind), location);
            }
            None => println!("  {role:8} not visible"),
        }
    }
}

fn kind_name(kind: ExposureKind) -> &'static str {
    match kind {
        ExposureKind::Serial => "serial",
        ExposureKind::MassStorage => "bootloader",
        ExposureKind::Unknown => "unknown",
    }
}
