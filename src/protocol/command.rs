//! Command definitions
//!
//! A command line is an ordered list of binary-safe arguments. The first
//! argument is the command name.

/// A command as it travels over the wire and into the AOF
pub type CmdLine = Vec<Vec<u8>>;

/// Build a command line from string-ish parts
pub fn to_cmd_line<S: AsRef<[u8]>>(parts: &[S]) -> CmdLine {
    parts.iter().map(|part| part.as_ref().to_vec()).collect()
}

/// Lowercased command name, or an empty string for an empty command line
pub fn cmd_name(args: &[Vec<u8>]) -> String {
    args.first()
        .map(|name| String::from_utf8_lossy(name).to_ascii_lowercase())
        .unwrap_or_default()
}
