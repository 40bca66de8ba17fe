//! Manifest parser: the declarative file-list grammar from spec §6.
//!
//! Line-oriented; `#` introduces a comment, blank lines are ignored,
//! leading whitespace is skipped. Errors cite the source file and line
//! number, matching the error contract in §7.

use std::path::{Path, PathBuf};

use crate::error::SqfsBuildError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionalId {
    Value(u32),
    /// `*`: preserve the value from the host source (glob only).
    Preserve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Value(u16),
    Preserve,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobType {
    Block,
    Char,
    Dir,
    Pipe,
    File,
    Symlink,
    Socket,
}

#[derive(Debug, Clone, Default)]
pub struct GlobOptions {
    /// `None` means "no -type filter seen": everything is permitted. Once
    /// any `-type` is seen, it clears the baseline to "deny all" and
    /// re-permits per flag, per §6.
    pub allowed_types: Option<Vec<GlobType>>,
    pub xdev: bool,
    pub keeptime: bool,
    pub nonrecursive: bool,
    pub name_pattern: Option<String>,
    pub path_pattern: Option<String>,
}

#[derive(Debug, Clone)]
pub enum EntryKind {
    Dir,
    Symlink {
        target: PathBuf,
    },
    Link {
        source: PathBuf,
    },
    Node {
        is_char: bool,
        major: u32,
        minor: u32,
    },
    Pipe,
    Sock,
    File {
        host_path: PathBuf,
    },
    Glob {
        options: GlobOptions,
        source_dir: PathBuf,
    },
}

#[derive(Debug, Clone)]
pub struct ManifestEntry {
    pub path: PathBuf,
    pub mode: Mode,
    pub uid: OptionalId,
    pub gid: OptionalId,
    pub kind: EntryKind,
    pub line: usize,
}

fn err(file: &Path, line: usize, message: impl Into<String>) -> SqfsBuildError {
    SqfsBuildError::Manifest {
        file: file.to_path_buf(),
        line,
        message: message.into(),
    }
}

/// Splits a line into whitespace-separated tokens, honoring `"..."`
/// quoting with `\"`/`\\` as the only escapes (per §6).
fn tokenize(file: &Path, line_no: usize, line: &str) -> Result<Vec<String>, SqfsBuildError> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' {
            chars.next();
            let mut token = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some('"') => token.push('"'),
                        Some('\\') => token.push('\\'),
                        Some(other) => {
                            token.push('\\');
                            token.push(other);
                        }
                        None => return Err(err(file, line_no, "unterminated escape in quoted string")),
                    },
                    Some(other) => token.push(other),
                    None => return Err(err(file, line_no, "unterminated quoted string")),
                }
            }
            tokens.push(token);
        } else {
            let mut token = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
            tokens.push(token);
        }
    }
    Ok(tokens)
}

/// Collapses `//` runs and rejects `..` path-escapes, per §6. Always
/// returns an absolute path.
pub fn canonicalize_path(file: &Path, line_no: usize, raw: &str) -> Result<PathBuf, SqfsBuildError> {
    if raw.is_empty() {
        return Err(err(file, line_no, "path must not be empty"));
    }
    let mut out = PathBuf::from("/");
    for component in raw.split('/') {
        if component.is_empty() {
            continue;
        }
        if component == "." {
            continue;
        }
        if component == ".." {
            return Err(err(file, line_no, "path must not contain '..' components"));
        }
        out.push(component);
    }
    Ok(out)
}

fn parse_mode(file: &Path, line_no: usize, tok: &str, allow_star: bool) -> Result<Mode, SqfsBuildError> {
    if tok == "*" {
        if allow_star {
            return Ok(Mode::Preserve);
        }
        return Err(err(file, line_no, "'*' is only legal for glob entries"));
    }
    let value =
        u16::from_str_radix(tok, 8).map_err(|_| err(file, line_no, "mode must be an octal number <= 07777"))?;
    if value > 0o7777 {
        return Err(err(file, line_no, "mode must be an octal number <= 07777"));
    }
    Ok(Mode::Value(value))
}

fn parse_id(file: &Path, line_no: usize, tok: &str, allow_star: bool) -> Result<OptionalId, SqfsBuildError> {
    if tok == "*" {
        if allow_star {
            return Ok(OptionalId::Preserve);
        }
        return Err(err(file, line_no, "'*' is only legal for glob entries"));
    }
    let value: u32 = tok
        .parse()
        .map_err(|_| err(file, line_no, "uid/gid must be a non-negative integer"))?;
    Ok(OptionalId::Value(value))
}

fn parse_glob_options(
    file: &Path,
    line_no: usize,
    tokens: &[String],
) -> Result<(GlobOptions, usize), SqfsBuildError> {
    let mut opts = GlobOptions::default();
    let mut i = 0;
    while i < tokens.len() {
        match tokens[i].as_str() {
            "--" => {
                return Ok((opts, i + 1));
            }
            "-type" => {
                let t = tokens
                    .get(i + 1)
                    .ok_or_else(|| err(file, line_no, "-type requires an argument"))?;
                let allowed = opts.allowed_types.get_or_insert_with(Vec::new);
                let kind = match t.as_str() {
                    "b" => GlobType::Block,
                    "c" => GlobType::Char,
                    "d" => GlobType::Dir,
                    "p" => GlobType::Pipe,
                    "f" => GlobType::File,
                    "l" => GlobType::Symlink,
                    "s" => GlobType::Socket,
                    _ => return Err(err(file, line_no, format!("unknown -type value '{t}'"))),
                };
                allowed.push(kind);
                i += 2;
            }
            "-xdev" | "-mount" => {
                opts.xdev = true;
                i += 1;
            }
            "-keeptime" => {
                opts.keeptime = true;
                i += 1;
            }
            "-nonrecursive" => {
                opts.nonrecursive = true;
                i += 1;
            }
            "-name" => {
                let p = tokens
                    .get(i + 1)
                    .ok_or_else(|| err(file, line_no, "-name requires an argument"))?;
                opts.name_pattern = Some(p.clone());
                i += 2;
            }
            "-path" => {
                let p = tokens
                    .get(i + 1)
                    .ok_or_else(|| err(file, line_no, "-path requires an argument"))?;
                opts.path_pattern = Some(p.clone());
                i += 2;
            }
            other => {
                return Err(err(
                    file,
                    line_no,
                    format!("unknown glob option '{other}' before '--'"),
                ));
            }
        }
    }
    // No explicit `--` terminator: the whole remainder was options.
    Ok((opts, tokens.len()))
}

/// Parses one manifest file into a flat list of entries, in file order.
pub fn parse_manifest(file: &Path, contents: &str) -> Result<Vec<ManifestEntry>, SqfsBuildError> {
    let mut entries = Vec::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = raw_line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let tokens = tokenize(file, line_no, trimmed)?;
        if tokens.len() < 5 {
            return Err(err(
                file,
                line_no,
                "expected '<type> <path> <mode|*> <uid|*> <gid|*> [<extra>]'",
            ));
        }

        let type_tok = tokens[0].as_str();
        let path_tok = tokens[1].as_str();
        let is_glob_or_dir = matches!(type_tok, "glob" | "dir");
        if path_tok == "/" && !is_glob_or_dir {
            return Err(err(file, line_no, "'/' is only legal for dir and glob entries"));
        }
        let path = canonicalize_path(file, line_no, path_tok)?;

        let allow_star = type_tok == "glob";
        let mode = parse_mode(file, line_no, &tokens[2], allow_star)?;
        let uid = parse_id(file, line_no, &tokens[3], allow_star)?;
        let gid = parse_id(file, line_no, &tokens[4], allow_star)?;
        let extra = &tokens[5..];

        let kind = match type_tok {
            "dir" => EntryKind::Dir,
            "slink" => {
                let target = extra
                    .first()
                    .ok_or_else(|| err(file, line_no, "slink requires a target"))?;
                EntryKind::Symlink {
                    target: PathBuf::from(target),
                }
            }
            "link" => {
                let source = extra
                    .first()
                    .ok_or_else(|| err(file, line_no, "link requires a source path"))?;
                EntryKind::Link {
                    source: PathBuf::from(source),
                }
            }
            "nod" => {
                if extra.len() < 3 {
                    return Err(err(file, line_no, "nod requires '<c|b> <major> <minor>'"));
                }
                let is_char = match extra[0].to_ascii_lowercase().as_str() {
                    "c" => true,
                    "b" => false,
                    _ => return Err(err(file, line_no, "nod type must be 'c' or 'b'")),
                };
                let major: u32 = extra[1]
                    .parse()
                    .map_err(|_| err(file, line_no, "nod major must be an integer"))?;
                let minor: u32 = extra[2]
                    .parse()
                    .map_err(|_| err(file, line_no, "nod minor must be an integer"))?;
                EntryKind::Node { is_char, major, minor }
            }
            "pipe" => EntryKind::Pipe,
            "sock" => EntryKind::Sock,
            "file" => {
                let host_path = extra
                    .first()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| path.clone());
                EntryKind::File { host_path }
            }
            "glob" => {
                let (options, consumed) = parse_glob_options(file, line_no, extra)?;
                let source_dir = extra
                    .get(consumed)
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("."));
                EntryKind::Glob { options, source_dir }
            }
            other => return Err(err(file, line_no, format!("unknown entry type '{other}'"))),
        };

        entries.push(ManifestEntry {
            path,
            mode,
            uid,
            gid,
            kind,
            line: line_no,
        });
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mode_over_limit() {
        let file = Path::new("manifest");
        let result = parse_manifest(file, "file /bin/sh 17777 0 0 sh.bin\n");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("octal number"));
    }

    #[test]
    fn parses_file_and_node_lines() {
        let file = Path::new("manifest");
        let entries =
            parse_manifest(file, "file /bin/sh 0755 0 0 sh.bin\nnod /dev/null 0666 0 0 c 1 3\n").unwrap();
        assert_eq!(entries.len(), 2);
        match &entries[0].kind {
            EntryKind::File { host_path } => assert_eq!(host_path, Path::new("sh.bin")),
            _ => panic!("expected file entry"),
        }
        match &entries[1].kind {
            EntryKind::Node { is_char, major, minor } => {
                assert!(is_char);
                assert_eq!(*major, 1);
                assert_eq!(*minor, 3);
            }
            _ => panic!("expected node entry"),
        }
    }

    #[test]
    fn parses_glob_line_with_options_and_source() {
        let file = Path::new("manifest");
        let entries =
            parse_manifest(file, "glob /usr/lib * * * -type f -name \"*.so\" -- ./lib\n").unwrap();
        assert_eq!(entries.len(), 1);
        match &entries[0].kind {
            EntryKind::Glob { options, source_dir } => {
                assert_eq!(source_dir, Path::new("./lib"));
                assert_eq!(options.name_pattern.as_deref(), Some("*.so"));
                assert_eq!(options.allowed_types, Some(vec![GlobType::File]));
            }
            _ => panic!("expected glob entry"),
        }
    }

    #[test]
    fn rejects_root_path_for_non_dir_glob_types() {
        let file = Path::new("manifest");
        let result = parse_manifest(file, "file / 0755 0 0\n");
        assert!(result.is_err());
    }

    #[test]
    fn rejects_dotdot_escape() {
        let file = Path::new("manifest");
        let result = parse_manifest(file, "dir /a/../b 0755 0 0\n");
        assert!(result.is_err());
    }

    #[test]
    fn canonicalize_collapses_double_slash() {
        let file = Path::new("manifest");
        let path = canonicalize_path(file, 1, "//usr//lib").unwrap();
        assert_eq!(path, PathBuf::from("/usr/lib"));
    }

    #[test]
    fn unknown_glob_option_before_terminator_is_an_error() {
        let file = Path::new("manifest");
        let result = parse_manifest(file, "glob /usr * * * -bogus -- ./x\n");
        assert!(result.is_err());
    }
}
