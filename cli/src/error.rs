use std::{fmt::Display, io};

use fleet::ScanError;

pub enum CliError {
    IO(io::Error),
    Scan(ScanError),
    NoDevices,
    NoImages,
    BatchPanicked,
}

impl From<io::Error> for CliError {
    fn from(value: io::Error) -> Self {
        CliError::IO(value)
    }
}

impl From<ScanError> for CliError {
    fn from(value: ScanError) -> Self {
        CliError::Scan(value)
    }
}

impl Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::IO(err) => write!(f, "IO error: {err}"),
            CliError::Scan(err) => write!(f, "discovery error: {err}"),
            CliError::NoDevices => write!(f, "no devices found"),
            CliError::NoImages => {
                write!(f, "nothing to flash, pass --main and/or --display")
            }
            CliError::BatchPanicked => write!(f, "batch worker panicked"),
        }
    }
}
