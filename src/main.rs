use std::{fs, path::{Path, PathBuf}, process};

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cinder::bytecode::disasm::print_iseq;
use cinder::bytecode::{CompileOptions, InstructionSequence, IseqKind, StaticOracle, compile, stack_check};
use cinder::lang::node::Scope;

#[derive(Parser)]
#[command(name = "cinder", version, about = "Compile a JSON syntax tree into bytecode")]
struct Cli {
    /// Syntax tree of the program, as JSON
    input: PathBuf,

    /// Name given to the top-level sequence
    #[arg(long, default_value = "<compiled>")]
    name: String,

    /// Kind of the top-level scope
    #[arg(long, value_enum, default_value_t = KindArg::Top)]
    kind: KindArg,

    /// Optimization preset
    #[arg(long, value_enum, default_value_t = OptLevel::Default)]
    opt: OptLevel,

    /// JSON file with compile options (overrides --opt)
    #[arg(long)]
    options: Option<PathBuf>,

    #[arg(long)]
    no_peephole: bool,
    #[arg(long)]
    no_tailcall: bool,
    #[arg(long)]
    no_specialization: bool,
    #[arg(long)]
    no_operands_unification: bool,
    #[arg(long)]
    no_instructions_unification: bool,
    #[arg(long)]
    no_stack_caching: bool,
    #[arg(long)]
    no_trace: bool,

    /// Treat these methods as redefined, disabling their specialized forms
    #[arg(long = "redefined", value_name = "METHOD")]
    redefined: Vec<String>,

    /// Print the disassembly
    #[arg(long)]
    disasm: bool,

    /// Write the sequence in binary form
    #[arg(long, value_name = "OUT")]
    emit: Option<PathBuf>,

    /// Print the sequence as JSON
    #[arg(long)]
    json: bool,

    /// Run the stack checker over the output
    #[arg(long)]
    verify: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Top,
    Main,
    Eval,
}

impl From<KindArg> for IseqKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Top => IseqKind::Top,
            KindArg::Main => IseqKind::Main,
            KindArg::Eval => IseqKind::Eval,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum OptLevel {
    All,
    None,
    Default,
}

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let options = resolve_options(&cli);

    let source = read_or_exit(&cli.input);
    let scope: Scope = match serde_json::from_str(&source) {
        Ok(scope) => scope,
        Err(e) => {
            eprintln!("Failed to parse '{}': {}", cli.input.display(), e);
            process::exit(1);
        }
    };

    let oracle = if cli.redefined.is_empty() {
        StaticOracle::pristine()
    } else {
        StaticOracle::with_redefined(cli.redefined.iter().cloned())
    };
    let path = cli.input.display().to_string();

    let iseq = match compile(&scope, &cli.name, &path, cli.kind.into(), &options, &oracle) {
        Ok(iseq) => iseq,
        Err(e) if e.is_internal() => {
            eprintln!("Internal compiler error: {}", e);
            process::exit(2);
        }
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };

    if cli.verify
        && let Err(e) = stack_check::check(&iseq)
    {
        eprintln!("{}", e);
        process::exit(2);
    }

    emit_outputs(&cli, &iseq);
}

fn resolve_options(cli: &Cli) -> CompileOptions {
    let mut options = match &cli.options {
        Some(file) => {
            let text = read_or_exit(file);
            match CompileOptions::from_json(&text) {
                Ok(options) => options,
                Err(e) => {
                    eprintln!("Invalid options file '{}': {}", file.display(), e);
                    process::exit(1);
                }
            }
        }
        None => match cli.opt {
            OptLevel::All => CompileOptions::all(),
            OptLevel::None => CompileOptions::none(),
            OptLevel::Default => CompileOptions::default(),
        },
    };

    if cli.no_peephole {
        options.peephole_optimization = false;
    }
    if cli.no_tailcall {
        options.tailcall_optimization = false;
    }
    if cli.no_specialization {
        options.specialized_instruction = false;
    }
    if cli.no_operands_unification {
        options.operands_unification = false;
    }
    if cli.no_instructions_unification {
        options.instructions_unification = false;
    }
    if cli.no_stack_caching {
        options.stack_caching = false;
    }
    if cli.no_trace {
        options.trace_instruction = false;
    }
    options
}

fn emit_outputs(cli: &Cli, iseq: &InstructionSequence) {
    if let Some(out) = &cli.emit {
        let bytes = match iseq.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                eprintln!("Failed to encode sequence: {}", e);
                process::exit(1);
            }
        };
        if let Err(e) = fs::write(out, bytes) {
            eprintln!("Failed to write '{}': {}", out.display(), e);
            process::exit(1);
        }
        tracing::info!(path = %out.display(), "wrote instruction sequence");
    }

    if cli.json {
        match serde_json::to_string_pretty(iseq) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("Failed to serialize sequence: {}", e);
                process::exit(1);
            }
        }
    }

    // disassembly is the default output
    if cli.disasm || (cli.emit.is_none() && !cli.json) {
        print_iseq(iseq);
    }
}

fn read_or_exit(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("Failed to read '{}': {}", path.display(), e);
            process::exit(1);
        }
    }
}
