use std::os::unix::io::RawFd;
use std::time::Duration;

/// Check if the given string slice is a valid C-style string.
///
/// Formally, this function checks whether the byte sequence of the string slice contains any
/// b'\x00'. If so, this function returns `false`.
///
/// ```ignore
/// assert!(is_valid_c_string("abc哈哈哈"));
/// assert!(!is_valid_c_string("abc\x00哈哈哈"));
/// ```
///
pub fn is_valid_c_string(s: &str) -> bool {
    !s.as_bytes().contains(&b'\x00')
}

/// Strip one layer of matching enclosing quote characters (`"` or `'`) from the given string. The
/// string is returned unchanged if it is not wrapped in a matching pair.
///
/// ```ignore
/// assert_eq!("echo hi", strip_enclosing_quotes("\"echo hi\""));
/// assert_eq!("echo hi", strip_enclosing_quotes("echo hi"));
/// ```
///
pub fn strip_enclosing_quotes(s: &str) -> &str {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if first == last && (first == b'"' || first == b'\'') {
            return &s[1..s.len() - 1];
        }
    }

    s
}

/// Split a command line into an argument vector.
///
/// Words are separated by whitespace. Single quotes preserve their content literally, double
/// quotes preserve their content except that a backslash escapes `"` and `\`. Outside quotes a
/// backslash escapes the next character. No expansion of any kind is performed. Returns `None` if
/// a quote is left open.
pub fn split_command_line(line: &str) -> Option<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next()? {
                        '\'' => break,
                        c => current.push(c),
                    }
                }
            },
            '"' => {
                in_word = true;
                loop {
                    match chars.next()? {
                        '"' => break,
                        '\\' => match chars.next()? {
                            c @ '"' | c @ '\\' => current.push(c),
                            c => {
                                current.push('\\');
                                current.push(c);
                            }
                        },
                        c => current.push(c),
                    }
                }
            },
            '\\' => {
                in_word = true;
                if let Some(c) = chars.next() {
                    current.push(c);
                }
            },
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::replace(&mut current, String::new()));
                    in_word = false;
                }
            },
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }

    if in_word {
        words.push(current);
    }

    Some(words)
}

/// Create a `Duration` instance from a native `timeval` structure.
pub fn duration_from_timeval(tv: &libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

/// Get the size of a memory page on the host, in bytes.
pub fn page_size() -> usize {
    // 4096 is the page size on every platform we run on; it is used only if `sysconf` fails.
    const FALLBACK_PAGE_SIZE: usize = 4096;

    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ret <= 0 {
        FALLBACK_PAGE_SIZE
    } else {
        ret as usize
    }
}

/// Duplicate `fd` onto `target` and close `fd`. The duplicated descriptor does not carry the
/// close-on-exec flag, so it survives the following `exec`.
pub fn redirect_fd(fd: RawFd, target: RawFd) -> nix::Result<()> {
    if fd == target {
        return Ok(());
    }

    nix::unistd::dup2(fd, target)?;
    nix::unistd::close(fd)?;
    Ok(())
}
