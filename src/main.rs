mod bytecode;
mod frontend;
mod lang;
mod repl;
mod runtime;
mod session;

use std::{env, fs, path::Path};

use crate::bytecode::Bytecode;
use crate::bytecode::disasm::{print_bytecode, print_bytecode_stats};
use crate::frontend::lexer::Lexer;
use crate::frontend::parser::parse_source;
use crate::frontend::token_dumper::TokenDumper;
use crate::runtime::vm::{Vm, VmConfig};
use crate::session::{SessionError, compile_source, read_bytecode, write_bytecode};

#[derive(Debug, Default)]
struct Options {
    tokens_only: bool,
    no_color: bool,
    pretty: bool,
    ast: bool,
    bytecode: bool,
    stats: bool,
    trace: bool,
    repl: bool,
    help: bool,
    emit: Option<String>,
    load: Option<String>,
    filename: Option<String>,
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut opts = Options::default();
    let mut iter = args.iter().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--tokens" => opts.tokens_only = true,
            "--no-color" => opts.no_color = true,
            "--pretty" => opts.pretty = true,
            "--ast" => opts.ast = true,
            "--bc" | "--bytecode" => opts.bytecode = true,
            "--stats" => opts.stats = true,
            "--trace" => opts.trace = true,
            "--repl" | "-i" => opts.repl = true,
            "--help" | "-h" => opts.help = true,
            "--emit" => {
                let out = iter.next().ok_or("--emit needs an output path")?;
                opts.emit = Some(out.clone());
            }
            "--load" => {
                let file = iter.next().ok_or("--load needs a bytecode file")?;
                opts.load = Some(file.clone());
            }
            flag if flag.starts_with('-') => return Err(format!("unknown option '{}'", flag)),
            // first non-flag argument is the filename
            file => {
                if opts.filename.is_none() {
                    opts.filename = Some(file.to_string());
                }
            }
        }
    }

    Ok(opts)
}

fn main() {
    let args: Vec<String> = env::args().collect();

    let opts = match parse_args(&args) {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_usage();
            std::process::exit(2);
        }
    };

    if opts.help {
        print_usage();
        return;
    }

    let config = VmConfig {
        trace: opts.trace,
        ..VmConfig::default()
    };

    if let Some(path) = &opts.load {
        match read_bytecode(Path::new(path)) {
            Ok(bc) => execute(bc, &opts, config),
            Err(e) => fail(&e),
        }
        return;
    }

    match &opts.filename {
        Some(filename) if !opts.repl => {
            ensure_extension(filename);
            match fs::read_to_string(filename) {
                Ok(source) => {
                    if opts.tokens_only {
                        dump_tokens(&source, opts.no_color, opts.pretty);
                    } else {
                        run_program(&source, &opts, config);
                    }
                }
                Err(e) => {
                    eprintln!("Failed to read '{}': {}", filename, e);
                    std::process::exit(1);
                }
            }
        }
        _ => repl::run_repl(config),
    }
}

fn ensure_extension(filename: &str) {
    let path = Path::new(filename);
    if path.extension().and_then(|e| e.to_str()) != Some("cin") {
        eprintln!("Error: expected a .cin file, got {}", filename);
        std::process::exit(1);
    }
}

fn dump_tokens(source: &str, no_color: bool, pretty: bool) {
    let mut lexer = Lexer::new(source);

    match lexer.tokenize() {
        Ok(tokens) => {
            let mut dumper = TokenDumper::new();

            if no_color {
                dumper = dumper.no_color();
            }
            if pretty {
                dumper = dumper.pretty();
            }

            dumper.dump(&tokens);
        }
        Err(e) => {
            eprintln!("Lexer error: {}", e);
            std::process::exit(1);
        }
    }
}

fn print_usage() {
    println!("CINDER - bytecode compiler and virtual machine");
    println!();
    println!("Usage:");
    println!("  cinder                          Start interactive REPL");
    println!("  cinder <file.cin>               Compile and run a program");
    println!("  cinder --repl, -i               Start interactive REPL");
    println!("  cinder --tokens <file.cin>      Show tokens only (--no-color, --pretty)");
    println!("  cinder --ast <file.cin>         Show the syntax tree");
    println!("  cinder --bc <file.cin>          Show disassembly, then run");
    println!("  cinder --stats <file.cin>       Show opcode statistics, then run");
    println!("  cinder --trace <file.cin>       Trace every instruction to stderr");
    println!("  cinder --emit <out> <file.cin>  Write compiled bytecode instead of running");
    println!("  cinder --load <file>            Run previously emitted bytecode");
    println!("  cinder --help, -h               Show this help");
}

fn run_program(source: &str, opts: &Options, config: VmConfig) {
    if opts.ast {
        match parse_source(source) {
            Ok(program) => println!("{:#?}", program),
            Err(e) => fail(&e),
        }
        return;
    }

    let bc = match compile_source(source) {
        Ok(bc) => bc,
        Err(e) => fail(&e),
    };

    if let Some(out) = &opts.emit {
        if let Err(e) = write_bytecode(&bc, Path::new(out)) {
            fail(&e);
        }
        eprintln!("wrote {}", out);
        return;
    }

    execute(bc, opts, config);
}

fn execute(bc: Bytecode, opts: &Options, config: VmConfig) {
    if opts.bytecode {
        print_bytecode(&bc);
    }
    if opts.stats {
        print_bytecode_stats(&bc);
        println!();
    }

    let mut vm = Vm::with_config(bc, config);
    if let Err(e) = vm.run() {
        fail(&SessionError::from(e));
    }
}

fn fail(e: &SessionError) -> ! {
    eprintln!("{}", e);
    if let Some(hint) = e.hint() {
        eprintln!("  hint: {}", hint);
    }
    std::process::exit(1);
}
