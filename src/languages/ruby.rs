//! Ruby
//!
//! The interpreter is either configured directly (`ruby`) or found under an
//! install prefix (`ruby_home/bin/ruby`). When a prefix is configured, the
//! prefix and each of its ancestors are added to the filesystem allow-list.

use std::path::PathBuf;

use crate::config::RuntimeTable;
use crate::engine::executor::LanguageSpec;
use crate::engine::sandbox::policy::install_home_chain;
use crate::engine::sandbox::{PolicyFragment, ProcessCeiling};

pub static RUBY: LanguageSpec = LanguageSpec {
    name: "RUBY",
    aliases: &["RB"],
    extension: "rb",
    run: &["{runtime}", "--disable-gems", "{source}"],
    runtime: "ruby",
    version_args: &["-v"],
    test_program: Some("puts gets"),
    locate,
    fragment,
    ..LanguageSpec::DEFAULT
};

const HOME_KEY: &str = "ruby_home";

fn locate(runtimes: &RuntimeTable, key: &str) -> Option<PathBuf> {
    if let Some(path) = runtimes.get(key) {
        return Some(path.to_path_buf());
    }
    if let Some(home) = runtimes.get(HOME_KEY) {
        return Some(home.join("bin").join("ruby"));
    }
    runtimes.find(key)
}

fn fragment(runtimes: &RuntimeTable) -> PolicyFragment {
    let mut fragment = PolicyFragment::new()
        .address_space_grace_kb(65536)
        // Newer interpreters start a timer thread.
        .processes(ProcessCeiling::HostDefault);
    if let Some(home) = runtimes.get(HOME_KEY) {
        fragment.fs.extend(install_home_chain(home));
    }
    fragment
}
