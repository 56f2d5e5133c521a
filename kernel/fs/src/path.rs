//! Pathname parsing.
//!
//! A full pathname is `[volume]filename`: the mountpoint in brackets,
//! then a non-empty filename. The volume part may be absent, which
//! parses as the empty volume name (and will fail mount lookup later —
//! that is the caller's business, not the parser's).

use crate::{NAME_LENGTH, Name, VfsError, VfsResult};

/// Splits a pathname into volume and filename.
///
/// # Errors
///
/// [`VfsError::Error`] on an unterminated or overlong volume part, an
/// empty filename, or an overlong filename.
pub fn parse(pathname: &str) -> VfsResult<(Name, Name)> {
    let bytes = pathname.as_bytes();

    let (volume, rest) = if let Some(stripped) = bytes.strip_prefix(b"[") {
        let close = stripped
            .iter()
            .position(|&b| b == b']')
            .ok_or(VfsError::Error)?;
        if close >= NAME_LENGTH - 1 {
            return Err(VfsError::Error);
        }
        (&stripped[..close], &stripped[close + 1..])
    } else {
        (&bytes[..0], bytes)
    };

    if rest.is_empty() || rest.len() >= NAME_LENGTH {
        return Err(VfsError::Error);
    }

    Ok((Name::from_bytes(volume), Name::from_bytes(rest)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_and_filename() {
        let (vol, file) = parse("[vol]file").unwrap();
        assert_eq!(vol.as_str(), "vol");
        assert_eq!(file.as_str(), "file");
    }

    #[test]
    fn bare_filename_has_empty_volume() {
        let (vol, file) = parse("nofile").unwrap();
        assert_eq!(vol.as_str(), "");
        assert!(vol.is_empty());
        assert_eq!(file.as_str(), "nofile");
    }

    #[test]
    fn empty_filename_is_an_error() {
        assert_eq!(parse("[vol]"), Err(VfsError::Error));
        assert_eq!(parse(""), Err(VfsError::Error));
    }

    #[test]
    fn unterminated_volume_is_an_error() {
        assert_eq!(parse("[volfile"), Err(VfsError::Error));
    }

    #[test]
    fn overlong_parts_are_errors() {
        assert_eq!(parse("[averylongvolumename]f"), Err(VfsError::Error));
        assert_eq!(parse("averylongfilenamethatoverflows"), Err(VfsError::Error));
        // The longest accepted filename.
        assert!(parse("fifteen-chars-x").is_ok());
    }
}
