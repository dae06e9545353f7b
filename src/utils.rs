use std::ffi::CStr;
use std::ffi::CString;

/// Reads a boolean environment flag. Absent or unparseable values fall back
/// to `default`.
pub fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "on" | "yes" | "y" => true,
            "0" | "false" | "off" | "no" | "n" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Turns a Rust string into a leaked, process-lifetime C string. Interior
/// nul bytes are stripped rather than rejected.
pub fn leak_cstr(s: &str) -> &'static CStr {
    let owned = match CString::new(s) {
        Ok(owned) => owned,
        Err(_) => CString::new(s.replace('\0', "")).unwrap_or_default(),
    };
    Box::leak(owned.into_boxed_c_str())
}
