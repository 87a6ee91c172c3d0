//! CLI argument definitions.

use std::path::PathBuf;

use clap::Parser;

/// Jobexec - run an external command as a job and report how it went
#[derive(Parser, Debug)]
#[command(name = "jobexec")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Directory to run the command in
    #[arg(short = 'C', long)]
    pub dir: Option<PathBuf>,

    /// Text piped to the command's standard input
    #[arg(long)]
    pub stdin: Option<String>,

    /// Run in the background and wait for completion separately
    #[arg(short, long)]
    pub background: bool,

    /// Kill the command if it is still running after this many milliseconds
    #[arg(long, value_name = "MS")]
    pub kill_after: Option<u64>,

    /// Caller-level job number recorded on the handle
    #[arg(long)]
    pub tag: Option<u64>,

    /// Print the job report as JSON instead of the captured output
    #[arg(long)]
    pub json: bool,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Command to run, followed by its arguments
    #[arg(
        value_name = "COMMAND",
        required = true,
        num_args = 1..,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub command_line: Vec<String>,
}

impl Cli {
    /// Program name and its arguments.
    pub fn program(&self) -> (&str, &[String]) {
        match self.command_line.split_first() {
            Some((command, args)) => (command.as_str(), args),
            None => ("", &[]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_args_keep_hyphens() {
        let cli = Cli::parse_from(["jobexec", "--json", "sh", "-c", "exit 3"]);
        assert!(cli.json);
        let (command, args) = cli.program();
        assert_eq!(command, "sh");
        assert_eq!(args, ["-c", "exit 3"]);
    }

    #[test]
    fn test_flags() {
        let cli = Cli::parse_from([
            "jobexec",
            "-vv",
            "-b",
            "--kill-after",
            "250",
            "--tag",
            "7",
            "-C",
            "/tmp",
            "sleep",
            "5",
        ]);
        assert_eq!(cli.verbose, 2);
        assert!(cli.background);
        assert_eq!(cli.kill_after, Some(250));
        assert_eq!(cli.tag, Some(7));
        assert_eq!(cli.dir, Some(PathBuf::from("/tmp")));
        assert_eq!(cli.program().1, ["5"]);
    }

    #[test]
    fn test_driver_flags_after_command_belong_to_command() {
        let cli = Cli::parse_from(["jobexec", "ls", "-C", "-v"]);
        assert_eq!(cli.verbose, 0);
        assert!(cli.dir.is_none());
        assert_eq!(cli.program(), ("ls", &["-C".to_string(), "-v".to_string()][..]));
    }

    #[test]
    fn test_command_required() {
        assert!(Cli::try_parse_from(["jobexec", "--json"]).is_err());
    }
}
