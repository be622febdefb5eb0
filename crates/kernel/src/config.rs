//! Command-line configuration store
//!
//! The loader hands the kernel a single space-separated `key=value` string.
//! It is captured once during early boot and never mutated afterwards, so
//! lookups are plain scans with no locking. Boolean options accept a few
//! affirmative spellings; numeric options accept 0x/0o/0b prefixes.

use spin::Once;

static CMDLINE: Once<&'static str> = Once::new();

const AFFIRMATIVE: [&str; 3] = ["true", "yes", "yeah"];

/// Capture the command line. Later calls are ignored; the store is sealed
/// after boot.
pub fn init(cmdline: &'static str) {
    let line = CMDLINE.call_once(|| cmdline);
    crate::info!("Config store init: {}", line);
}

fn source() -> &'static str {
    CMDLINE.get().copied().unwrap_or("")
}

/// Scan `source` for `key=value` and return the value portion.
fn lookup<'a>(source: &'a str, key: &str) -> Option<&'a str> {
    for token in source.split_ascii_whitespace() {
        if let Some((name, value)) = token.split_once('=') {
            if name == key {
                return Some(value);
            }
        }
    }
    None
}

fn parse_num(raw: &str) -> Option<usize> {
    let (digits, radix) = if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        (hex, 16)
    } else if let Some(bin) = raw.strip_prefix("0b").or_else(|| raw.strip_prefix("0B")) {
        (bin, 2)
    } else if raw.len() > 1 && raw.starts_with('0') {
        (&raw[1..], 8)
    } else {
        (raw, 10)
    };
    usize::from_str_radix(digits, radix).ok()
}

/// Raw string value for `key`, if present on the command line.
pub fn get(key: &str) -> Option<&'static str> {
    lookup(source(), key)
}

pub fn get_num(key: &str, default: usize) -> usize {
    get(key).and_then(parse_num).unwrap_or(default)
}

pub fn get_bool(key: &str, default: bool) -> bool {
    match get(key) {
        Some(raw) => AFFIRMATIVE.contains(&raw) || parse_num(raw).is_some_and(|n| n != 0),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE: &str =
        "kernel.scheduler.priorities=8 kernel.clock.force_sw_uptime=yes \
         kernel.heap.trash_before_use=true npk.x86.debugcon_do_colour=0 \
         kernel.clock.uptime_freq=0x40";

    #[test]
    fn lookup_finds_values() {
        assert_eq!(lookup(LINE, "kernel.scheduler.priorities"), Some("8"));
        assert_eq!(lookup(LINE, "kernel.clock.force_sw_uptime"), Some("yes"));
        assert_eq!(lookup(LINE, "missing.key"), None);
    }

    #[test]
    fn numbers_parse_with_prefixes() {
        assert_eq!(parse_num("123"), Some(123));
        assert_eq!(parse_num("0x40"), Some(64));
        assert_eq!(parse_num("0b101"), Some(5));
        assert_eq!(parse_num("017"), Some(15));
        assert_eq!(parse_num("junk"), None);
    }

    #[test]
    fn bools_accept_affirmatives() {
        assert!(AFFIRMATIVE.contains(&"yes"));
        assert_eq!(lookup(LINE, "npk.x86.debugcon_do_colour"), Some("0"));
        assert_eq!(parse_num("0"), Some(0));
    }
}
