use std::{fs, path::Path};

use anyhow::Context;

/// Rewrites the first `key=` line of a properties text. Every other line is
/// kept byte for byte, including its line ending. A missing key is appended.
pub fn set_property(contents: &str, key: &str, value: &str) -> String {
    let prefix = format!("{key}=");
    let mut out = String::with_capacity(contents.len() + prefix.len() + value.len() + 1);
    let mut replaced = false;

    for line in contents.split_inclusive('\n') {
        if !replaced && line.starts_with(&prefix) {
            let ending = if line.ends_with("\r\n") {
                "\r\n"
            } else if line.ends_with('\n') {
                "\n"
            } else {
                ""
            };
            out.push_str(&prefix);
            out.push_str(value);
            out.push_str(ending);
            replaced = true;
            continue;
        }
        out.push_str(line);
    }

    if !replaced {
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&prefix);
        out.push_str(value);
        out.push('\n');
    }
    out
}

/// Patches the server port in `server.properties` in place.
pub fn patch_server_port(path: &Path, key: &str, port: u16) -> anyhow::Result<()> {
    let existing =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let patched = set_property(&existing, key, &port.to_string());
    fs::write(path, patched.as_bytes()).with_context(|| format!("write {}", path.display()))?;
    tracing::info!(path = %path.display(), port, "server port updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROPS: &str = "#Minecraft server properties\r\nmotd=A Minecraft Server\nserver-port=25565\nlevel-name=world\nquery.port=25565\n";

    #[test]
    fn only_the_port_line_changes() {
        let out = set_property(PROPS, "server-port", "50123");
        let before: Vec<&str> = PROPS.split_inclusive('\n').collect();
        let after: Vec<&str> = out.split_inclusive('\n').collect();
        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(&after) {
            if b.starts_with("server-port=") {
                assert_eq!(*a, "server-port=50123\n");
            } else {
                assert_eq!(a, b);
            }
        }
    }

    #[test]
    fn similar_keys_are_not_touched() {
        let out = set_property("server-portal=1\nserver-port=2\n", "server-port", "3");
        assert_eq!(out, "server-portal=1\nserver-port=3\n");
    }

    #[test]
    fn missing_key_is_appended_once() {
        let out = set_property("motd=hi", "server-port", "50000");
        assert_eq!(out, "motd=hi\nserver-port=50000\n");
        assert_eq!(out.matches("server-port=").count(), 1);
    }

    #[test]
    fn crlf_ending_is_preserved_on_the_patched_line() {
        let out = set_property("server-port=1\r\nmotd=x\r\n", "server-port", "2");
        assert_eq!(out, "server-port=2\r\nmotd=x\r\n");
    }

    #[test]
    fn patch_round_trips_through_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.properties");
        fs::write(&path, PROPS).unwrap();

        patch_server_port(&path, "server-port", 49999).unwrap();

        let reread = fs::read_to_string(&path).unwrap();
        assert_eq!(reread.matches("server-port=").count(), 1);
        assert!(reread.contains("server-port=49999\n"));
        assert!(reread.starts_with("#Minecraft server properties\r\nmotd=A Minecraft Server\n"));
        assert!(reread.ends_with("level-name=world\nquery.port=25565\n"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(patch_server_port(&dir.path().join("nope.properties"), "server-port", 1).is_err());
    }
}
