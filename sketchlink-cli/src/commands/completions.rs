//! Shell completion generation.

use clap::CommandFactory;
use clap_complete::{Shell, generate};
use std::io;

use crate::Cli;

/// Generate shell completions to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(shell: Shell) -> String {
        let mut cmd = Cli::command();
        let mut out = Vec::new();
        generate(shell, &mut cmd, "sketchlink", &mut out);
        String::from_utf8_lossy(&out).into_owned()
    }

    #[test]
    fn test_bash_completions_cover_subcommands() {
        let script = render(Shell::Bash);
        assert!(script.contains("sketchlink"));
        assert!(script.contains("upload"));
        assert!(script.contains("--ack-timeout-ms"));
    }

    #[test]
    fn test_fish_completions_are_generated() {
        assert!(render(Shell::Fish).contains("complete -c sketchlink"));
    }
}
