//! Python 3

use crate::engine::executor::LanguageSpec;

pub static PY3: LanguageSpec = LanguageSpec {
    name: "PY3",
    aliases: &["PYTHON3", "PYTHON", "PY"],
    extension: "py",
    // No bytecode files, no site packages.
    run: &["{runtime}", "-B", "-S", "{source}"],
    runtime: "python3",
    env: &[("PYTHONIOENCODING", "utf8")],
    version_args: &["-V"],
    test_program: Some("import sys\nsys.stdout.write(sys.stdin.read())\n"),
    ..LanguageSpec::DEFAULT
};
