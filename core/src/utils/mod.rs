use std::fs::File;
use std::io;
use std::io::BufRead;
use std::path::Path;

use url::Url;

use crate::error::ValidationError;

/// Parses and checks a submitted target: absolute, `http`/`https`, with a host.
pub fn validate_target(raw: &str) -> Result<Url, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyTarget);
    }

    let url = Url::parse(trimmed).map_err(|e| ValidationError::InvalidUrl(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(ValidationError::UnsupportedScheme(other.to_string())),
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ValidationError::MissingHost);
    }
    Ok(url)
}

/// Reads a file line-by-line, returning all non-empty trimmed lines.
/// Lines starting with `#` are comments.
pub fn read_lines(path: &str) -> io::Result<Vec<String>> {
    let file = File::open(Path::new(path))?;
    let reader = io::BufReader::new(file);
    let lines = reader
        .lines()
        .filter_map(|line| {
            let line = line.ok()?;
            let trimmed = line.trim().to_string();
            if trimmed.is_empty() || trimmed.starts_with('#') { None } else { Some(trimmed) }
        })
        .collect();
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_validate_target() {
        assert!(validate_target("https://example.com").is_ok());
        assert!(validate_target("  http://example.com/a?b=c  ").is_ok());
        assert_eq!(validate_target(""), Err(ValidationError::EmptyTarget));
        assert_eq!(
            validate_target("ftp://example.com"),
            Err(ValidationError::UnsupportedScheme("ftp".into()))
        );
        assert!(matches!(validate_target("example.com"), Err(ValidationError::InvalidUrl(_))));
        assert!(matches!(validate_target("http://"), Err(ValidationError::InvalidUrl(_))));
    }

    #[test]
    fn test_read_lines_skips_blanks_and_comments() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "http://a.com\n\n  # staging\nhttp://b.com  ").unwrap();
        let lines = read_lines(file.path().to_str().unwrap()).unwrap();
        assert_eq!(lines, vec!["http://a.com", "http://b.com"]);
    }
}
