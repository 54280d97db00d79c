//! Platform mount-table scan for candidate bootloader volumes.
//!
//! Candidates are just directories; callers decide what is actually a
//! bootloader volume by reading its marker file.

use std::path::PathBuf;

#[cfg(target_os = "linux")]
pub fn candidate_volumes() -> std::io::Result<Vec<PathBuf>> {
    let table = std::fs::read_to_string("/proc/mounts")?;
    Ok(table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|mount_point| PathBuf::from(unescape_mount_point(mount_point)))
        .collect())
}

/// `/proc/mounts` escapes space, tab, newline and backslash as octal.
#[cfg(target_os = "linux")]
fn unescape_mount_point(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let digits: String = chars.by_ref().take(3).collect();
        match u8::from_str_radix(&digits, 8) {
            Ok(byte) => out.push(byte as char),
            Err(_) => {
                out.push('\\');
                out.push_str(&digits);
            }
        }
    }
    out
}

#[cfg(target_os = "macos")]
pub fn candidate_volumes() -> std::io::Result<Vec<PathBuf>> {
    Ok(std::fs::read_dir("/Volumes")?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect())
}

#[cfg(target_os = "windows")]
pub fn candidate_volumes() -> std::io::Result<Vec<PathBuf>> {
    Ok(('A'..='Z')
        .map(|letter| PathBuf::from(format!("{letter}:\\")))
        .filter(|root| root.exists())
        .collect())
}
