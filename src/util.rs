use crate::error::MkvmError;

/// Parse a disk or memory size such as `"16G"` or `"512M"` into bytes.
///
/// Binary units, matching what QEMU and anita-style sizing expect
/// (1G = 1024³ bytes). A bare number is taken as bytes.
pub fn parse_size(s: &str) -> Result<u64, MkvmError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(MkvmError::Validation {
            message: "size cannot be empty".into(),
        });
    }

    let (num_str, suffix) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(i) => (&s[..i], s[i..].to_ascii_uppercase()),
        None => (s, String::new()),
    };

    let num: u64 = num_str.parse().map_err(|_| MkvmError::Validation {
        message: format!("invalid size number: '{num_str}'"),
    })?;

    let multiplier: u64 = match suffix.as_str() {
        "" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        "T" | "TB" => 1024 * 1024 * 1024 * 1024,
        _ => {
            return Err(MkvmError::Validation {
                message: format!("unknown size suffix: '{suffix}' (use K, M, G or T)"),
            });
        }
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| MkvmError::Validation {
            message: format!("size overflows: '{s}'"),
        })
}

/// Size in whole mebibytes, as passed to `qemu -m`.
pub fn size_in_mib(s: &str) -> Result<u64, MkvmError> {
    let bytes = parse_size(s)?;
    let mib = bytes / (1024 * 1024);
    if mib == 0 {
        return Err(MkvmError::Validation {
            message: format!("memory size '{s}' is smaller than 1M"),
        });
    }
    Ok(mib)
}

/// Short label for a guest command: its first line, with a marker when
/// the command continues (heredocs).
pub fn command_label(command: &str) -> String {
    let mut lines = command.lines();
    let first = lines.next().unwrap_or("").trim();
    if lines.next().is_some() {
        format!("{first} …")
    } else {
        first.to_string()
    }
}

pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
