use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

pub const DIR_MODE: u32 = 0o700;

pub fn retry_on_interrupt<T, F>(mut operation: F) -> Result<T, std::io::Error>
where
    F: FnMut() -> Result<T, std::io::Error>,
{
    loop {
        match operation() {
            Ok(result) => return Ok(result),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Lstat based existence check, so dangling symlinks count as present.
pub fn file_exists<P: AsRef<Path>>(path: P) -> bool {
    fs::symlink_metadata(path).is_ok()
}

pub fn create_directory_recursive<P: AsRef<Path>>(path: P, mode: u32) -> std::io::Result<()> {
    fs::DirBuilder::new()
        .mode(mode)
        .recursive(true)
        .create(path)
}

/// Splits on whitespace, except inside double quotes.  Quote characters are
/// kept in the emitted fields.
pub fn split_quoted(s: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut cur = String::new();
    let mut in_quote = false;

    for c in s.chars() {
        if c == '"' {
            in_quote = !in_quote;
            cur.push(c);
        } else if c.is_whitespace() && !in_quote {
            if !cur.is_empty() {
                fields.push(std::mem::take(&mut cur));
            }
        } else {
            cur.push(c);
        }
    }
    if !cur.is_empty() {
        fields.push(cur);
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_quoted() {
        let fields = split_quoted(r#"42 BUILT PURPOSE=GENERAL SOCKS_PASSWORD="a b c""#);
        assert_eq!(
            fields,
            vec![
                "42",
                "BUILT",
                "PURPOSE=GENERAL",
                r#"SOCKS_PASSWORD="a b c""#
            ]
        );
    }

    #[test]
    fn test_split_quoted_empty() {
        assert!(split_quoted("").is_empty());
        assert!(split_quoted("   ").is_empty());
    }
}
