use clap::Command;
use clap_complete::Shell;
use std::io;

/// Write a completion script for `cmd` to stdout
pub fn generate(shell: Shell, cmd: &mut Command) {
    let name = cmd.get_name().to_string();
    clap_complete::generate(shell, cmd, name, &mut io::stdout());
}
