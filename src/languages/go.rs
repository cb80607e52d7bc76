//! Go

use std::sync::OnceLock;

use regex::bytes::Regex;

use crate::config::RuntimeTable;
use crate::core::{JudgeError, Result};
use crate::engine::executor::{ExecutorKind, LanguageSpec};
use crate::engine::sandbox::{PolicyFragment, ProcessCeiling};

const ECHO: &str = r#"package main

import "os"
import "fmt"
import "bufio"

func main() {
    bio := bufio.NewReader(os.Stdin)
    text, _ := bio.ReadString(0)
    fmt.Print(text)
}
"#;

pub static GO: LanguageSpec = LanguageSpec {
    name: "GO",
    aliases: &["GOLANG"],
    extension: "go",
    kind: ExecutorKind::Compiled {
        compile: &["{compiler}", "build", "-o", "{executable}", "{sources}"],
        executable: "main",
    },
    run: &["{executable}"],
    runtime: "go",
    // cgo would let submissions link arbitrary libraries
    compile_env: &[("CGO_ENABLED", "0")],
    version_args: &["version"],
    test_program: Some(ECHO),
    fragment,
    validate: Some(require_package_main),
    ..LanguageSpec::DEFAULT
};

fn fragment(_: &RuntimeTable) -> PolicyFragment {
    // The runtime reserves its heap arena map in the data segment.
    PolicyFragment::new()
        .allow("mincore")
        .memory_grace_kb(65536)
        .address_space_grace_kb(786432)
        .processes(ProcessCeiling::HostDefault)
}

/// Reject sources whose first statement is not `package main`.
pub fn require_package_main(source: &[u8]) -> Result<()> {
    static BLOCK: OnceLock<Regex> = OnceLock::new();
    static LINE: OnceLock<Regex> = OnceLock::new();
    let block = BLOCK.get_or_init(|| Regex::new(r"(?s)/\*.*?\*/").expect("static pattern"));
    let line = LINE.get_or_init(|| Regex::new(r"//[^\r\n]*").expect("static pattern"));

    let stripped = block.replace_all(source, &b""[..]);
    let stripped = line.replace_all(&stripped, &b""[..]);
    let first = stripped
        .split(|b| *b == b'\n')
        .map(|l| l.trim_ascii())
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    let tokens: Vec<&[u8]> = first
        .split(|b| b.is_ascii_whitespace())
        .filter(|t| !t.is_empty())
        .collect();

    if tokens == [&b"package"[..], &b"main"[..]] {
        Ok(())
    } else {
        Err(JudgeError::compile("Your code must be defined in package main.\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_package_main_after_comments() {
        let source = b"// Copyright\n/* multi\n line */\npackage main\n\nfunc main() {}\n";
        assert!(require_package_main(source).is_ok());
        assert!(require_package_main(ECHO.as_bytes()).is_ok());
        assert!(require_package_main(b"/* x */ package   main // trailing\n").is_ok());
    }

    #[test]
    fn test_rejects_other_packages() {
        for source in [
            &b"package util\nfunc main() {}\n"[..],
            b"// package main\npackage foo\n",
            b"/* package main */\n",
            b"",
            b"package main2\n",
        ] {
            let err = require_package_main(source).unwrap_err();
            assert!(matches!(err, JudgeError::Compile(ref m) if m.contains("package main")));
        }
    }
}
