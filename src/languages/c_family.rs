//! C and C++ (GCC).

use crate::engine::executor::{ExecutorKind, LanguageSpec};

const ECHO_C: &str = r#"#include <stdio.h>

int main(void) {
    int c;
    while ((c = getchar()) != EOF)
        putchar(c);
    return 0;
}
"#;

const ECHO_CPP: &str = r#"#include <iostream>

int main() {
    std::cout << std::cin.rdbuf();
    return 0;
}
"#;

pub static C: LanguageSpec = LanguageSpec {
    name: "C",
    aliases: &["C11"],
    extension: "c",
    kind: ExecutorKind::Compiled {
        compile: &["{compiler}", "{flags}", "-o", "{executable}", "{sources}", "-lm"],
        executable: "main",
    },
    run: &["{executable}"],
    runtime: "gcc",
    flags: &["-std=c11", "-O2"],
    test_program: Some(ECHO_C),
    ..LanguageSpec::DEFAULT
};

pub static CPP: LanguageSpec = LanguageSpec {
    name: "CPP17",
    aliases: &["CPP", "C++", "C++17"],
    extension: "cpp",
    kind: ExecutorKind::Compiled {
        compile: &["{compiler}", "{flags}", "-o", "{executable}", "{sources}"],
        executable: "main",
    },
    run: &["{executable}"],
    runtime: "g++",
    flags: &["-std=c++17", "-O2"],
    test_program: Some(ECHO_CPP),
    ..LanguageSpec::DEFAULT
};

/// Whether a file name is a C or C++ translation unit.
pub fn is_c_family_source(name: &str) -> bool {
    matches!(
        std::path::Path::new(name).extension().and_then(|e| e.to_str()),
        Some("c" | "cpp")
    )
}
