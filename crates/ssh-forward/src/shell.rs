//! Command lines sent over session channels. Remote paths and modes come from
//! deployment manifests, so everything is single-quoted before it reaches `sh`.

/// Single-quote `value` for a POSIX shell; an embedded `'` becomes `'\''`.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Wrap `command` for `exec` so it always runs under `sh`, whatever the login shell
pub fn run_command(command: &str) -> String {
    format!("sh -c {}", quote(command))
}

/// Command that writes stdin to `path` and then applies `mode`.
pub fn upload_command(path: &str, mode: &str) -> String {
    format!(
        "cat > {path} && chmod {mode} {path}",
        path = quote(path),
        mode = quote(mode)
    )
}
