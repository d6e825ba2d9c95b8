use std::ffi::CStr;

use anyhow::{bail, Result};

/// Shell-escape a string by wrapping it in single quotes.
///
/// Single quotes inside the string are handled by ending the single-quoted
/// segment, inserting an escaped single quote, and starting a new segment:
/// `it's` becomes `'it'\''s'`.
pub(crate) fn shell_escape(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len() + 2);
    escaped.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            escaped.push_str("'\\''");
        } else {
            escaped.push(ch);
        }
    }
    escaped.push('\'');
    escaped
}

/// Quote a crontab argument only when it needs it.
pub(crate) fn shell_word(s: &str) -> String {
    let plain = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@+,".contains(c));
    if plain {
        s.to_string()
    } else {
        shell_escape(s)
    }
}

/// Short hostname of this machine, as used by Proxmox for the node name.
pub(crate) fn hostname() -> Result<String> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        bail!("gethostname failed: {}", std::io::Error::last_os_error());
    }
    // Not guaranteed NUL-terminated on truncation.
    buf[buf.len() - 1] = 0;
    let name = CStr::from_bytes_until_nul(&buf)
        .map_err(|e| anyhow::anyhow!("gethostname returned garbage: {}", e))?
        .to_string_lossy();
    let short = name.split('.').next().unwrap_or_default().trim();
    if short.is_empty() {
        bail!("hostname is empty");
    }
    Ok(short.to_string())
}
