mod bytecode;
mod runtime;

use std::{env, fs, path::Path, process};

use crate::bytecode::builder::{self, BlockDef};
use crate::bytecode::disasm;
use crate::bytecode::load;
use crate::runtime::value::class;
use crate::runtime::vm::{RunState, Vm, VmConfig};

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    let raw_image = args.contains(&"--image".to_string());
    let dis_only = args.contains(&"--dis".to_string());
    if args.contains(&"--help".to_string()) || args.contains(&"-h".to_string()) {
        print_usage();
        return;
    }

    // first non-flag argument is the filename
    let filename = args.iter().skip(1).find(|a| !a.starts_with('-'));

    match filename {
        Some(filename) => {
            let bytes = match fs::read(filename) {
                Ok(b) => b,
                Err(e) => {
                    eprintln!("Failed to read '{}': {}", filename, e);
                    process::exit(1);
                }
            };
            let image = if raw_image {
                bytes
            } else {
                ensure_extension(filename);
                decode_program(&bytes)
            };
            run_image(&image, dis_only);
        }
        None => print_usage(),
    }
}

fn ensure_extension(filename: &str) {
    let path = Path::new(filename);
    if path.extension().and_then(|e| e.to_str()) != Some("cbc") {
        eprintln!("Error: expected a .cbc program, got {}", filename);
        process::exit(1);
    }
}

/// Program files carry a postcard-encoded block tree; turn it into the
/// fixed-width image the loader consumes.
fn decode_program(bytes: &[u8]) -> Vec<u8> {
    let def: BlockDef = match postcard::from_bytes(bytes) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Malformed program file: {}", e);
            process::exit(1);
        }
    };
    builder::encode_image(&def)
}

fn run_image(image: &[u8], dis_only: bool) {
    let config = VmConfig::default();

    let arena = match load::load_image(image, config.max_regs) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("Load error: {}", e);
            process::exit(1);
        }
    };

    if dis_only {
        disasm::print_arena(&arena);
        return;
    }

    // Convention: the root's i-th child block is the body of the root's
    // i-th symbol, bound on Object so any receiver dispatches to it.
    let root = arena.block(arena.root());
    let bindings: Vec<_> = root
        .syms
        .iter()
        .zip(root.children.iter())
        .map(|(sym, child)| (arena.sym_name(*sym).to_string(), *child))
        .collect();

    let mut vm = match Vm::open(config) {
        Ok(vm) => vm,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };

    if let Err(e) = vm.begin(arena) {
        eprintln!("{}", e);
        process::exit(1);
    }

    for (name, body) in &bindings {
        if let Err(e) = vm.define_method(class::OBJECT, name, *body) {
            eprintln!("{}", e);
            process::exit(1);
        }
    }

    loop {
        match vm.run() {
            Ok(RunState::Complete) => break,
            Ok(RunState::Preempted) => continue,
            Err(e) => {
                eprintln!("{} (in {})", e, vm.callee_name());
                let code = vm.error_code();
                vm.end();
                process::exit(if code < 0 { -code } else { 1 });
            }
        }
    }

    println!("=> {}", vm.register(0));
    vm.end();
    vm.close();
}

fn print_usage() {
    println!("CINDER - embedded bytecode executor");
    println!();
    println!("Usage:");
    println!("  cinder <file.cbc>         Run a postcard-encoded program");
    println!("  cinder --image <file>     Run a raw device image");
    println!("  cinder --dis <file>       Disassemble instead of running");
    println!("  cinder --help, -h         Show this help");
}
