/// Prism CLI.
/// Orchestrates run, check, and dump over the compile pipeline.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser as ClapParser, Subcommand};

use prism::diagnostics::DiagnosticEngine;
use prism::loader::{merge_files, Loader};
use prism::vm::Vm;
use prism::{Diagnostics, VmConfig};

#[derive(ClapParser)]
#[command(
    name = "prism",
    version = "0.1.0",
    about = "The Prism language runtime",
    long_about = "prism — compile and execute Prism (.prism) programs on the bytecode VM."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and execute a Prism source file
    Run {
        path: PathBuf,
        /// Dump the token stream and continue
        #[arg(long)]
        tokens: bool,
        /// Dump the parsed AST and continue
        #[arg(long)]
        ast: bool,
        /// Dump disassembled bytecode and continue
        #[arg(long)]
        bytecode: bool,
        /// Stop after parsing (syntax check only)
        #[arg(long)]
        parse: bool,
        /// Track allocation sites for the GC leak report
        #[arg(long)]
        trace_gc: bool,
    },
    /// Parse and type-check without executing
    Check { path: PathBuf },
    /// Compile to a bytecode image on disk
    Dump {
        path: PathBuf,
        /// Output file (default: alongside the source, .prismc)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => code,
    }
}

fn read_source(path: &PathBuf) -> Result<String, ExitCode> {
    std::fs::read_to_string(path).map_err(|e| {
        eprintln!("error: cannot read '{}': {}", path.display(), e);
        ExitCode::FAILURE
    })
}

/// Front half of the pipeline: load imports, merge, check, compile, verify.
fn build(path: &PathBuf, source: &str) -> Result<prism::Program, ExitCode> {
    let engine = DiagnosticEngine::new(path.display().to_string(), source.to_string());

    let mut loader = Loader::for_entry(path);
    let files = loader.load_program(path).map_err(|e| {
        eprintln!("error: {}", e);
        ExitCode::FAILURE
    })?;
    if engine.emit_all(&loader.diagnostics) {
        return Err(ExitCode::FAILURE);
    }

    let merged = merge_files(files);

    let outcome = prism::Checker::new().check_file(&merged);
    if engine.emit_all(&outcome.diagnostics) {
        return Err(ExitCode::FAILURE);
    }

    let program = match prism::compile(&[merged]) {
        Ok(p) => p,
        Err(errors) => {
            let mut bag = Diagnostics::new();
            for e in errors {
                bag.error("CompileError", e.to_string(), e.span());
            }
            engine.emit_all(&bag);
            return Err(ExitCode::FAILURE);
        }
    };

    if let Err(e) = prism::verifier::verify_program(&program.functions) {
        eprintln!("error: [VerificationError] {}", e);
        return Err(ExitCode::FAILURE);
    }

    Ok(program)
}

fn dispatch(cli: Cli) -> Result<(), ExitCode> {
    match cli.command {
        // ----------------------------------------------------------------
        // prism run <file.prism> [--tokens] [--ast] [--bytecode] [--parse]
        // ----------------------------------------------------------------
        Commands::Run { path, tokens, ast, bytecode, parse, trace_gc } => {
            let source = read_source(&path)?;

            if tokens {
                let mut lexer = prism::Lexer::new(&source, 0);
                for (tok, span) in lexer.tokenize() {
                    println!("{:>4}:{:<3} {:?}", span.line, span.col, tok);
                }
                for e in &lexer.errors {
                    eprintln!("lex error: {}", e);
                }
            }

            if ast || parse {
                let (file, lex_errors, parse_errors) = prism::parser::parse_source(&source, 0);
                let mut bag = Diagnostics::new();
                for e in &lex_errors {
                    bag.push_lex(e);
                }
                for e in &parse_errors {
                    bag.push_parse(e);
                }
                let engine = DiagnosticEngine::new(path.display().to_string(), source.clone());
                let failed = engine.emit_all(&bag);
                if ast {
                    println!("{:#?}", file);
                }
                if parse {
                    return if failed { Err(ExitCode::FAILURE) } else { Ok(()) };
                }
                if failed {
                    return Err(ExitCode::FAILURE);
                }
            }

            let program = build(&path, &source)?;

            if bytecode {
                for f in &program.functions {
                    print!("{}", f.chunk.disassemble(&f.name));
                }
            }

            let mut config = VmConfig::default();
            config.gc_debug = trace_gc;
            let mut vm = Vm::with_output(config, Box::new(std::io::stdout()));
            vm.install(program);
            match vm.run() {
                Ok(()) => {
                    if trace_gc {
                        for (site, n) in vm.heap.leak_report() {
                            eprintln!("[gc] live {} x{}", site, n);
                        }
                    }
                    Ok(())
                }
                Err(e) => {
                    eprintln!("runtime error: {}", e);
                    Err(ExitCode::FAILURE)
                }
            }
        }

        // ----------------------------------------------------------------
        // prism check <file.prism>
        // ----------------------------------------------------------------
        Commands::Check { path } => {
            let source = read_source(&path)?;
            build(&path, &source)?;
            println!("ok: no issues found in '{}'", path.display());
            Ok(())
        }

        // ----------------------------------------------------------------
        // prism dump <file.prism> [-o out.prismc]
        // ----------------------------------------------------------------
        Commands::Dump { path, output } => {
            let source = read_source(&path)?;
            let program = build(&path, &source)?;
            let bytes = prism::container::write_program(&program);
            let out = output.unwrap_or_else(|| path.with_extension("prismc"));
            std::fs::write(&out, &bytes).map_err(|e| {
                eprintln!("error: cannot write '{}': {}", out.display(), e);
                ExitCode::FAILURE
            })?;
            println!("wrote {} bytes to '{}'", bytes.len(), out.display());
            Ok(())
        }
    }
}
