//! Command line interface definition using clap.
//!
//! The generator takes one or more declarative documents and produces a
//! build description plus a diagnostic graph dump in the destination
//! directory.

use camino::Utf8PathBuf;
use clap::Parser;

/// Generate a Ninja test-matrix build description from declarative input.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Input configuration documents, merged by top-level key.
    #[arg(value_name = "CONFIG", required = true)]
    pub inputs: Vec<Utf8PathBuf>,

    /// Root directory where source files live and artifacts are installed.
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub install_root: Utf8PathBuf,

    /// Directory receiving the build description and graph dump.
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub destination: Utf8PathBuf,

    /// Restrict emission to node types matching these glob patterns.
    #[arg(long = "type", value_name = "PATTERN")]
    pub types: Vec<String>,

    /// Global tag filter; only derived nodes satisfying it are emitted.
    #[arg(long, value_name = "EXPR", default_value = "")]
    pub filter: String,

    /// Enable verbose diagnostic logging.
    #[arg(short, long)]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn parses_full_invocation() {
        let cli = Cli::parse_from([
            "tessera",
            "base.yml",
            "extra.yml",
            "--install-root",
            "/srv/tests",
            "--destination",
            "out",
            "--type",
            "compile-*",
            "--type",
            "run",
            "--filter",
            "arch_x86 and !broken",
            "--verbose",
        ]);
        assert_eq!(cli.inputs.len(), 2);
        assert_eq!(cli.install_root, Utf8PathBuf::from("/srv/tests"));
        assert_eq!(cli.destination, Utf8PathBuf::from("out"));
        assert_eq!(cli.types, ["compile-*", "run"]);
        assert_eq!(cli.filter, "arch_x86 and !broken");
        assert!(cli.verbose);
    }

    #[rstest]
    fn at_least_one_input_is_required() {
        assert!(Cli::try_parse_from(["tessera"]).is_err());
    }
}
