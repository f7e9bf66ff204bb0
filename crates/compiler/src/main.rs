//! Clove CLI
//!
//! `run` evaluates a source file, `eval` a one-shot expression, `repl`
//! starts a line-edited session, `compare` runs the tree-walk oracle
//! against the VM, and `build`/`load` produce and execute AOT artefacts.

use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{Shell, generate};
use clovec::{CloveError, EvalConfig, Session, render_error, run_compare};
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::rc::Rc;

#[derive(ClapParser)]
#[command(name = "clove")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Clove - a Clojure dialect on a bytecode VM", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a source file
    Run {
        /// Input .clj source file
        input: PathBuf,

        /// Limits configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Evaluate one expression and print the result
    Eval {
        /// Expression text
        #[arg(value_name = "EXPR")]
        expr: String,

        /// Limits configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Start a read-eval-print loop
    Repl {
        /// Limits configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Run both backends over a file and report divergences
    Compare {
        /// Input .clj source file
        input: PathBuf,

        /// Limits configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Compile a file to a CLJC artefact
    Build {
        /// Input .clj source file
        input: PathBuf,

        /// Output artefact path (defaults to the input with .cljc)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Execute a CLJC artefact
    Load {
        /// Artefact produced by `clove build`
        input: PathBuf,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { input, config } => run_file(&input, config.as_deref()),
        Commands::Eval { expr, config } => run_eval(&expr, config.as_deref()),
        Commands::Repl { config } => run_repl(config.as_deref()),
        Commands::Compare { input, config } => run_compare_file(&input, config.as_deref()),
        Commands::Build { input, output } => run_build(&input, output),
        Commands::Load { input } => run_load(&input),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "clove", &mut io::stdout());
        }
    }
}

fn load_config(path: Option<&Path>) -> EvalConfig {
    match path {
        Some(path) => match EvalConfig::from_toml_file(path) {
            Ok(config) => config,
            Err(message) => {
                eprintln!("{}", message);
                process::exit(2);
            }
        },
        None => EvalConfig::default(),
    }
}

fn fail(err: &CloveError) -> ! {
    eprintln!("{}", render_error(err));
    process::exit(1);
}

fn run_file(input: &Path, config: Option<&Path>) {
    let mut session = Session::new(load_config(config));
    match session.eval_file(input) {
        Ok(value) => println!("{}", value.pr_str()),
        Err(err) => fail(&err),
    }
}

fn run_eval(expr: &str, config: Option<&Path>) {
    let mut session = Session::new(load_config(config));
    match session.eval_str(expr) {
        Ok(value) => println!("{}", value.pr_str()),
        Err(err) => fail(&err),
    }
}

fn run_repl(config: Option<&Path>) {
    let mut session = Session::new(load_config(config));
    let mut editor = match rustyline::DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            eprintln!("failed to start repl: {}", err);
            process::exit(1);
        }
    };
    println!("Clove {} - :repl/quit or Ctrl-D to exit", env!("CARGO_PKG_VERSION"));
    loop {
        let prompt = format!("{}=> ", session.env().current_ns_name());
        match editor.readline(&prompt) {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if trimmed == ":repl/quit" {
                    break;
                }
                let _ = editor.add_history_entry(&line);
                // errors are reported and the session continues
                match session.eval_str(&line) {
                    Ok(value) => println!("{}", value.pr_str()),
                    Err(err) => eprintln!("{}", render_error(&err)),
                }
            }
            Err(rustyline::error::ReadlineError::Interrupted) => continue,
            Err(rustyline::error::ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("repl error: {}", err);
                break;
            }
        }
    }
}

fn run_compare_file(input: &Path, config: Option<&Path>) {
    let source = match std::fs::read_to_string(input) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("failed to read {}: {}", input.display(), err);
            process::exit(1);
        }
    };
    match run_compare(&source, &load_config(config)) {
        Ok(report) if report.agreed() => {
            println!("backends agree on {} forms", report.forms);
        }
        Ok(report) => {
            eprintln!(
                "{} of {} forms diverged:",
                report.divergences.len(),
                report.forms
            );
            for divergence in &report.divergences {
                eprintln!("  form: {}", divergence.form);
                eprintln!("    vm:        {}", divergence.vm_result);
                eprintln!("    tree-walk: {}", divergence.tree_result);
            }
            process::exit(1);
        }
        Err(err) => fail(&err),
    }
}

fn run_build(input: &Path, output: Option<PathBuf>) {
    let output = output.unwrap_or_else(|| input.with_extension("cljc"));
    let source = match std::fs::read_to_string(input) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("failed to read {}: {}", input.display(), err);
            process::exit(1);
        }
    };
    let mut session = Session::new(EvalConfig::default());
    let chunk = match session.build_str(&source) {
        Ok(chunk) => chunk,
        Err(err) => fail(&err),
    };
    let bytes = match clove_runtime::write_artifact(&chunk) {
        Ok(bytes) => bytes,
        Err(err) => fail(&CloveError::Serialize(err)),
    };
    if let Err(err) = std::fs::write(&output, bytes) {
        eprintln!("failed to write {}: {}", output.display(), err);
        process::exit(1);
    }
    println!("wrote {}", output.display());
}

fn run_load(input: &Path) {
    let bytes = match std::fs::read(input) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("failed to read {}: {}", input.display(), err);
            process::exit(1);
        }
    };
    let env = clove_runtime::default_env();
    clovec::install_reader_builtins(&env);
    let chunk = match clove_runtime::read_artifact(&bytes, &env) {
        Ok(chunk) => chunk,
        Err(err) => fail(&CloveError::Serialize(err)),
    };
    let mut vm = clove_runtime::Vm::new(env);
    match vm.run_chunk(Rc::new(chunk)) {
        Ok(value) => println!("{}", value.pr_str()),
        Err(err) => fail(&CloveError::Runtime(err)),
    }
}
