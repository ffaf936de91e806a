use std::path::PathBuf;

use clap::{ColorChoice, Parser};

#[derive(Parser, Debug, Clone)]
pub struct Options {
    #[arg(short, long, global = true, default_value = "false")]
    pub verbose: bool,

    #[arg(long, global = true, default_value_t = ColorChoice::Auto)]
    pub color: ColorChoice,

    /// The state file. It is created by the first `apply`.
    #[arg(long, global = true, default_value = "rigger-state.json")]
    pub state: PathBuf,

    /// The deployment document, listing the resources to manage
    #[arg(long, global = true, default_value = "rigger.json")]
    pub deployment: PathBuf,

    /// Maximum number of resource operations to run at the same time
    #[arg(
        long,
        global = true,
        default_value_t = 5,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub concurrency: u16,

    /// Trust the state file instead of reading resources before diffing
    #[arg(long, global = true, default_value_t = false)]
    pub no_read: bool,
}

impl Options {
    pub fn use_color(&self) -> bool {
        use std::io::IsTerminal as _;
        match self.color {
            ColorChoice::Always => true,
            ColorChoice::Never => false,
            ColorChoice::Auto => std::io::stderr().is_terminal(),
        }
    }
}
