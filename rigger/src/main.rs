mod apply;
mod deployment;
mod interrupt;
mod local;
mod logging;
mod options;
mod state;

use anyhow::{Context as _, Result};
use apply::Mode;
use clap::{CommandFactory as _, Parser, Subcommand};
use options::Options;
use state::StateFile;
use std::process::exit;

fn main() {
    let args = Args::parse();
    handle_result(run_args(args));
}

fn run_args(args: Args) -> Result<()> {
    let mut logging = logging::set_up(logging::Options {
        verbose: args.options.verbose,
        color: args.options.use_color(),
    })?;
    let r = run_command(&args);
    logging.tear_down()?;
    r
}

fn run_command(args: &Args) -> Result<()> {
    match &args.command {
        Commands::Plan => apply::run(&args.options, Mode::Plan),
        Commands::Apply => apply::run(&args.options, Mode::Apply),
        Commands::Destroy => apply::run(&args.options, Mode::Destroy),
        Commands::State(sub) => match sub {
            StateCommands::Show {} => state_show(&args.options),
        },
        Commands::GenerateMan => (|| {
            let cmd = Args::command();
            let man = clap_mangen::Man::new(cmd);
            let mut buffer: Vec<u8> = Default::default();
            man.render(&mut buffer)?;
            println!("{}", String::from_utf8(buffer)?);
            Ok(())
        })(),
        Commands::GenerateMarkdown => {
            let opts = clap_markdown::MarkdownOptions::new().show_footer(false);
            let markdown: String = clap_markdown::help_markdown_custom::<Args>(&opts);
            println!("{}", markdown);
            Ok(())
        }
        Commands::GenerateCompletion { shell } => {
            let mut cmd = Args::command();
            clap_complete::generate(*shell, &mut cmd, "rigger", &mut std::io::stdout());
            Ok(())
        }
    }
}

fn state_show(options: &Options) -> Result<()> {
    let mut state_file = StateFile::open(&options.state)?;
    let bytes = state_file.lock()?.read()?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        println!("[]");
        return Ok(());
    }
    let state: serde_json::Value = serde_json::from_slice(&bytes)
        .with_context(|| format!("Invalid state file {}", options.state.display()))?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

fn handle_result(r: Result<()>) {
    match r {
        Ok(()) => {}
        Err(e) => {
            eprintln!("rigger error: {}, {:#}", e.root_cause(), e);
            exit(1);
        }
    }
}

/// rigger: reconcile local resources with a deployment document
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    options: Options,
}

#[derive(Subcommand, Debug)]
enum StateCommands {
    /// Print the state file
    Show {},
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the changes that `apply` would make
    Plan,

    /// Apply changes so that the resources are in the desired state
    Apply,

    /// Delete every resource recorded in the state
    Destroy,

    /// Commands that operate on the state file
    #[command(subcommand)]
    State(StateCommands),

    /// Generate markdown documentation for rigger
    #[command(hide = true)]
    GenerateMarkdown,

    /// Generate a manpage for rigger
    #[command(hide = true)]
    GenerateMan,

    /// Generate shell completion for rigger
    #[command(hide = true)]
    GenerateCompletion {
        /// The shell to generate completion for
        #[arg(long)]
        shell: clap_complete::Shell,
    },
}
