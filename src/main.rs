//! Tensor lowering CLI
//!
//! Usage:
//!   tlower lower program.tc
//!   tlower lower program.tc --flatten --target cuda
//!   tlower intrinsics --family mma
//!   tlower intrinsics --show cuda_ldmatrix_x4_trans --json

use clap::{Parser as ClapParser, Subcommand, ValueEnum};
use colored::Colorize;
use std::fs;
use std::io::{self, Read};
use tracing_subscriber::EnvFilter;

use tensor_lowering::intrinsics::Family;
use tensor_lowering::{flatten_function, lower_source, Function, FunctionKind, FunctionRegistry};

#[derive(ClapParser, Debug)]
#[command(name = "tlower")]
#[command(version = "0.1.0")]
#[command(about = "Lowers tensor compute definitions to loop nests and lists GPU intrinsics")]
struct Args {
    /// Verbose output (debug logging)
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Lower a compute definition into a loop nest
    Lower {
        /// Source file; reads stdin when omitted
        #[arg(value_name = "FILE")]
        input_file: Option<String>,

        /// Function kind to emit
        #[arg(short = 't', long = "target", value_enum, default_value = "host")]
        target: Target,

        /// Flatten multi-dimensional tensor indices
        #[arg(long = "flatten")]
        flatten: bool,

        /// Output as JSON
        #[arg(short = 'j', long = "json")]
        json_output: bool,
    },
    /// List the synthesized device functions
    Intrinsics {
        /// Only list one family
        #[arg(long = "family", value_enum)]
        family: Option<FamilyArg>,

        /// Print the definition of one function
        #[arg(long = "show", value_name = "NAME")]
        show: Option<String>,

        /// Output as JSON
        #[arg(short = 'j', long = "json")]
        json_output: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Target {
    Host,
    Cuda,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FamilyArg {
    CpAsync,
    Mma,
    Ldmatrix,
    Pipeline,
}

impl From<FamilyArg> for Family {
    fn from(arg: FamilyArg) -> Self {
        match arg {
            FamilyArg::CpAsync => Family::CpAsync,
            FamilyArg::Mma => Family::Mma,
            FamilyArg::Ldmatrix => Family::LdMatrix,
            FamilyArg::Pipeline => Family::Pipeline,
        }
    }
}

fn fail(what: &str, err: impl std::fmt::Display) -> ! {
    eprintln!("{}: {}", what.red(), err);
    std::process::exit(1);
}

fn main() {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(io::stderr)
        .init();

    match args.command {
        Command::Lower {
            input_file,
            target,
            flatten,
            json_output,
        } => run_lower(input_file, target, flatten, json_output),
        Command::Intrinsics {
            family,
            show,
            json_output,
        } => run_intrinsics(family.map(Family::from), show, json_output),
    }
}

fn run_lower(input_file: Option<String>, target: Target, flatten: bool, json_output: bool) {
    // Get source from file or stdin
    let (source, name) = if let Some(file) = input_file {
        let source = fs::read_to_string(&file)
            .unwrap_or_else(|e| fail("Error", format!("Failed to read file '{}': {}", file, e)));
        let name = std::path::Path::new(&file)
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|s| s.replace(|c: char| !c.is_ascii_alphanumeric(), "_"))
            .unwrap_or_else(|| "main".to_string());
        (source, name)
    } else {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .unwrap_or_else(|e| fail("Error", format!("Failed to read stdin: {}", e)));
        (buffer, "main".to_string())
    };

    let kind = match target {
        Target::Host => FunctionKind::Host,
        Target::Cuda => FunctionKind::CudaKernel,
    };
    let mut func = lower_source(&source, &name, kind).unwrap_or_else(|e| fail("Lowering error", e));
    if flatten {
        func = flatten_function(&func).unwrap_or_else(|e| fail("Flatten error", e));
    }

    if json_output {
        match serde_json::to_string_pretty(&func) {
            Ok(json) => println!("{}", json),
            Err(e) => fail("Error", format!("Failed to serialize to JSON: {}", e)),
        }
    } else {
        print_function(&func);
    }
}

fn print_function(func: &Function) {
    println!("{}", "Lowered Function".bold().green());
    println!("{}", "=".repeat(50));
    println!("{}: {}", "Name".cyan(), func.name);
    println!("{}: {}", "Parameters".cyan(), func.params.len());
    println!("{}: {}", "Locals".cyan(), func.local_vars.len());
    println!();
    print!("{}", func);
}

fn run_intrinsics(family: Option<Family>, show: Option<String>, json_output: bool) {
    let registry = FunctionRegistry::global().unwrap_or_else(|e| fail("Registry error", e));

    if let Some(name) = show {
        let func = registry.lookup(&name).unwrap_or_else(|e| fail("Error", e));
        if json_output {
            match serde_json::to_string_pretty(func) {
                Ok(json) => println!("{}", json),
                Err(e) => fail("Error", format!("Failed to serialize to JSON: {}", e)),
            }
        } else {
            print!("{}", func);
        }
        return;
    }

    let names: Vec<&str> = registry
        .names()
        .filter(|name| family.map_or(true, |f| Family::of(name) == Some(f)))
        .collect();

    if json_output {
        match serde_json::to_string_pretty(&names) {
            Ok(json) => println!("{}", json),
            Err(e) => fail("Error", format!("Failed to serialize to JSON: {}", e)),
        }
        return;
    }

    println!("{}", "Registered Intrinsics".bold().green());
    println!("{}", "=".repeat(50));
    for name in &names {
        println!("  {}", name);
    }
    println!();
    println!("{}: {}", "Total".cyan(), names.len());
}
