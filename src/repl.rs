use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

use crate::lang::value::Value;
use crate::runtime::vm::VmConfig;
use crate::session::Session;

const PROMPT: &str = "cinder> ";

pub fn run_repl(config: VmConfig) {
    println!("Cinder {} - type :help for commands, Ctrl+D to exit.", env!("CARGO_PKG_VERSION"));

    let mut rl = match DefaultEditor::new() {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("Failed to start line editor: {}", e);
            std::process::exit(1);
        }
    };
    let mut session = Session::with_config(config);

    loop {
        match rl.readline(PROMPT) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line);

                match line {
                    ":help" => {
                        print_help();
                        continue;
                    }
                    ":constants" => {
                        for (i, constant) in session.constants().iter().enumerate() {
                            println!("[{}] {}", i, constant);
                        }
                        continue;
                    }
                    ":quit" | ":exit" => break,
                    _ => {}
                }

                match session.eval(line) {
                    // statements leave null behind; don't echo it
                    Ok(Value::Null) => {}
                    Ok(value) => println!("{}", value),
                    Err(e) => {
                        eprintln!("{}", e);
                        if let Some(hint) = e.hint() {
                            eprintln!("  hint: {}", hint);
                        }
                    }
                }
            }

            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => break,
            Err(e) => {
                eprintln!("Error: {}", e);
                break;
            }
        }
    }
}

fn print_help() {
    println!("Enter statements like: let add = fn(a, b) {{ a + b }}; add(1, 2)");
    println!("Bindings persist between lines; a failed line is discarded.");
    println!();
    println!("  :constants   show the constant pool");
    println!("  :help        show this help");
    println!("  :quit        leave the REPL");
}
