use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tempfile::NamedTempFile;

use crate::crypto::random_bytes;

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

pub fn now_string() -> String {
    now_ms().to_string()
}

/// `id-<unix ms>-<20 hex chars>`, unique enough for a single-user database.
pub fn new_id() -> String {
    let bytes = random_bytes::<10>();
    let mut hex = String::with_capacity(20);
    for b in bytes {
        hex.push_str(format!("{:02x}", b).as_str());
    }
    format!("id-{}-{hex}", now_string())
}

/// Strips control characters and truncates to `max_len` chars.
pub fn clamp_string(value: &str, max_len: usize, trim: bool) -> String {
    let source = if trim { value.trim() } else { value };
    source
        .chars()
        .filter(|ch| {
            let code = *ch as u32;
            code >= 32 && code != 127
        })
        .take(max_len)
        .collect()
}

/// Like [`clamp_string`] but keeps line breaks, for multi-line notes.
pub fn clamp_multiline(value: &str, max_len: usize) -> String {
    value
        .chars()
        .filter(|ch| matches!(ch, '\n' | '\t') || (*ch as u32 >= 32 && *ch as u32 != 127))
        .take(max_len)
        .collect()
}

/// Writes `content` to `path`, creating parent directories.
///
/// With `atomic` set the bytes go to a temp file in the same directory which
/// is then renamed over `path`, so readers see either the old or new file.
pub fn write_text_file(path: &Path, content: &str, atomic: bool) -> io::Result<()> {
    let parent = path.parent().filter(|dir| !dir.as_os_str().is_empty());
    if let Some(parent) = parent {
        fs::create_dir_all(parent)?;
    }
    if !atomic {
        return fs::write(path, content);
    }
    let mut tmp = NamedTempFile::new_in(parent.unwrap_or_else(|| Path::new(".")))?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_prefixed() {
        let first = new_id();
        let second = new_id();
        assert!(first.starts_with("id-"));
        assert_ne!(first, second);
        assert_eq!(first.rsplit('-').next().map(str::len), Some(20));
    }

    #[test]
    fn clamp_strips_controls_and_truncates() {
        assert_eq!(clamp_string("  ab\u{7}cdef  ", 4, true), "abcd");
        assert_eq!(clamp_string("a\nb", 10, false), "ab");
        assert_eq!(clamp_multiline("a\nb\u{0}c", 10), "a\nbc");
    }

    #[test]
    fn writes_atomically_and_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("file.json");
        write_text_file(&path, "first", true).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "first");
        write_text_file(&path, "second", false).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        write_text_file(&path, "third", true).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "third");
        let leftovers = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
