//! Kernel boot arguments.
//!
//! The boot loader leaves a space-separated `key=value` string for the
//! kernel; it is parsed once into a fixed-capacity table and queried by
//! key. A key without `=` carries the empty string as its value.

use alloc::string::{String, ToString};

use kudos_core::config::BOOTARGS_MAX;
use kudos_core::sync::SpinLock;

use planck_noalloc::vec::ArrayVec;

static BOOTARGS: SpinLock<ArrayVec<(String, String), BOOTARGS_MAX>> =
    SpinLock::new(ArrayVec::new());

/// Parses the boot argument string. Arguments beyond the table capacity
/// are dropped.
pub fn init(args: &str) {
    let mut table = BOOTARGS.lock();
    table.clear();

    for token in args.split_whitespace() {
        let (key, value) = match token.split_once('=') {
            Some((key, value)) => (key, value),
            None => (token, ""),
        };
        if table.try_push((key.to_string(), value.to_string())).is_err() {
            break;
        }
    }
}

/// Looks up a boot argument by key.
///
/// Returns the (possibly empty) value, or `None` if the key was not
/// given.
pub fn get(key: &str) -> Option<String> {
    let table = BOOTARGS.lock();
    table
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, MutexGuard};

    static GUARD: Mutex<()> = Mutex::new(());

    fn serialize() -> MutexGuard<'static, ()> {
        GUARD.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn parses_keys_values_and_bare_flags() {
        let _g = serialize();
        init("initprog=[disk]shell randomseed=42 testconsole");

        assert_eq!(get("initprog").as_deref(), Some("[disk]shell"));
        assert_eq!(get("randomseed").as_deref(), Some("42"));
        assert_eq!(get("testconsole").as_deref(), Some(""));
        assert_eq!(get("absent"), None);
    }

    #[test]
    fn reinit_replaces_previous_arguments() {
        let _g = serialize();
        init("a=1");
        init("b=2");
        assert_eq!(get("a"), None);
        assert_eq!(get("b").as_deref(), Some("2"));
    }

    #[test]
    fn empty_string_yields_no_arguments() {
        let _g = serialize();
        init("");
        assert_eq!(get("anything"), None);
    }

    #[test]
    fn excess_arguments_are_dropped() {
        let _g = serialize();
        let args: Vec<String> = (0..BOOTARGS_MAX + 10).map(|i| format!("k{i}=v")).collect();
        init(&args.join(" "));
        assert_eq!(get("k0").as_deref(), Some("v"));
        assert_eq!(get(&format!("k{}", BOOTARGS_MAX - 1)).as_deref(), Some("v"));
        assert_eq!(get(&format!("k{BOOTARGS_MAX}")), None);
    }
}
