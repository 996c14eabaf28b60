use std::{env, fs, process::ExitCode, time::Instant};

use vesper::{Vm, compile, read_all};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let file_path = if args.len() > 1 { &args[1] } else { "example.scm" };
    let source = match read_file(file_path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let forms = match read_all(&source) {
        Ok(forms) => forms,
        Err(err) => {
            eprintln!("{file_path}: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut vm = Vm::new();
    let start = Instant::now();
    for form in &forms {
        match compile(&mut vm, form, None) {
            Ok(code) => {
                println!(";;; {form}");
                print!("{}", code.disassemble());
            }
            Err(err) => {
                eprintln!("{file_path}: {err}");
                return ExitCode::FAILURE;
            }
        }
    }
    let elapsed = start.elapsed();
    eprintln!("compiled {} form(s) in {elapsed:?}", forms.len());
    ExitCode::SUCCESS
}

fn read_file(path: &str) -> Result<String, String> {
    fs::read_to_string(path).map_err(|err| format!("cannot read {path}: {err}"))
}
